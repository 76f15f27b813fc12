//! Geräte-Abstraktion
//!
//! Der Call-Task fordert Mikrofon (und ggf. Kamera) über `MediaDevices` an und
//! öffnet darüber das Ausgabegerät. `SystemMedia` ist die cpal-Implementierung,
//! Tests verwenden eine Attrappe.

use super::audio::{AudioError, DeviceOutput, MicrophoneCapture};
use super::playback::{AudioOutput, UnitId};
use super::session::CallFault;
use super::stats::AudioLevels;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Kapazität des Kanals für rohe Mikrofon-Frames
const RAW_AUDIO_QUEUE: usize = 64;

/// Kamera-Unterstützung einkompiliert (Feature `camera`)
pub const CAMERA_SUPPORTED: bool = cfg!(feature = "camera");

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Camera error: {0}")]
    Camera(String),
}

// ============================================================================
// FRAMES & STREAMS
// ============================================================================

/// Rohes Kamerabild, RGB8 zeilenweise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Liefert das jeweils aktuellste Kamerabild
pub trait FrameSource: Send + Sync {
    fn latest_frame(&self) -> Option<RawFrame>;
}

/// Angeforderte Geräte eines Anrufs
///
/// Solange der Wert lebt, sind die Geräte belegt; `release` gibt sie frei.
pub struct MediaStreams {
    audio: Option<mpsc::Receiver<Vec<f32>>>,
    video: Option<Arc<dyn FrameSource>>,
    guard: Option<Box<dyn Send>>,
}

impl MediaStreams {
    pub fn new(
        audio: mpsc::Receiver<Vec<f32>>,
        video: Option<Arc<dyn FrameSource>>,
        guard: impl Send + 'static,
    ) -> Self {
        Self {
            audio: Some(audio),
            video,
            guard: Some(Box::new(guard)),
        }
    }

    /// Mono-Frames mit der Eingangsrate, kann nur einmal entnommen werden
    pub fn take_audio(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.audio.take()
    }

    pub fn video(&self) -> Option<Arc<dyn FrameSource>> {
        self.video.clone()
    }

    /// Gibt alle Geräte frei
    pub fn release(&mut self) {
        self.audio = None;
        self.video = None;
        if self.guard.take().is_some() {
            tracing::debug!("Media devices released");
        }
    }
}

impl Drop for MediaStreams {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreams")
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .field("held", &self.guard.is_some())
            .finish()
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// Anforderung von Mikrofon und Kamera
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub want_video: bool,
    /// Zielrate der gelieferten Frames
    pub sample_rate: u32,
    pub faults: mpsc::UnboundedSender<CallFault>,
}

/// Anforderung des Ausgabegeräts
#[derive(Debug, Clone)]
pub struct OutputRequest {
    /// Rate der dekodierten Puffer
    pub sample_rate: u32,
    pub channels: u16,
    /// Fertig abgespielte Einheiten
    pub completions: mpsc::UnboundedSender<UnitId>,
    pub faults: mpsc::UnboundedSender<CallFault>,
    pub levels: Arc<AudioLevels>,
}

// ============================================================================
// DEVICES TRAIT
// ============================================================================

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fordert Mikrofon und optional Kamera an
    async fn acquire(&self, request: CaptureRequest) -> Result<MediaStreams, MediaError>;

    /// Öffnet das Ausgabegerät
    fn open_output(&self, request: OutputRequest) -> Result<Box<dyn AudioOutput>, MediaError>;
}

// ============================================================================
// SYSTEM MEDIA
// ============================================================================

/// Echte Geräte über cpal (und nokhwa mit Feature `camera`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMedia;

impl SystemMedia {
    pub fn new() -> Self {
        Self
    }
}

/// Hält Mikrofon und Kamera am Leben
struct SystemGuard {
    _microphone: MicrophoneCapture,
    #[cfg(feature = "camera")]
    _camera: Option<super::camera::CameraCapture>,
}

#[async_trait]
impl MediaDevices for SystemMedia {
    async fn acquire(&self, request: CaptureRequest) -> Result<MediaStreams, MediaError> {
        // Vor dem Mikrofon prüfen, sonst wäre es kurz belegt
        if request.want_video && !CAMERA_SUPPORTED {
            return Err(MediaError::Camera(
                "built without camera support (enable the `camera` feature)".to_string(),
            ));
        }

        let (frames_tx, frames_rx) = mpsc::channel(RAW_AUDIO_QUEUE);

        // cpal-Geräte blockieren beim Öffnen
        let rate = request.sample_rate;
        let faults = request.faults.clone();
        let microphone = tokio::task::spawn_blocking(move || {
            MicrophoneCapture::start(rate, frames_tx, faults)
        })
        .await
        .map_err(|e| MediaError::Audio(AudioError::StreamBuildError(e.to_string())))?
        .map_err(|e| match e {
            AudioError::NoInputDevice => MediaError::PermissionDenied(e.to_string()),
            other => MediaError::Audio(other),
        })?;

        #[cfg(feature = "camera")]
        {
            let (camera, video) = if request.want_video {
                let faults = request.faults.clone();
                let camera =
                    tokio::task::spawn_blocking(move || super::camera::CameraCapture::open(faults))
                        .await
                        .map_err(|e| MediaError::Camera(e.to_string()))??;
                let source = camera.source();
                (Some(camera), Some(source))
            } else {
                (None, None)
            };

            Ok(MediaStreams::new(
                frames_rx,
                video,
                SystemGuard {
                    _microphone: microphone,
                    _camera: camera,
                },
            ))
        }

        #[cfg(not(feature = "camera"))]
        {
            Ok(MediaStreams::new(
                frames_rx,
                None,
                SystemGuard {
                    _microphone: microphone,
                },
            ))
        }
    }

    fn open_output(&self, request: OutputRequest) -> Result<Box<dyn AudioOutput>, MediaError> {
        let output = DeviceOutput::open(request)?;
        Ok(Box::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_drops_guard_once() {
        let released = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = mpsc::channel(1);
        let mut streams = MediaStreams::new(rx, None, Flag(Arc::clone(&released)));

        assert!(streams.take_audio().is_some());
        assert!(streams.take_audio().is_none());
        assert!(!released.load(Ordering::SeqCst));

        streams.release();
        assert!(released.load(Ordering::SeqCst));
        streams.release();
    }

    #[cfg(not(feature = "camera"))]
    #[tokio::test]
    async fn video_without_camera_support_fails_before_opening_devices() {
        let (faults, _rx) = mpsc::unbounded_channel();
        let request = CaptureRequest {
            want_video: true,
            sample_rate: 16_000,
            faults,
        };

        let err = SystemMedia::new().acquire(request).await.unwrap_err();
        assert!(matches!(err, MediaError::Camera(msg) if msg.contains("camera")));
    }

    #[test]
    fn drop_releases_devices() {
        let released = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = mpsc::channel(1);
        let streams = MediaStreams::new(rx, None, Flag(Arc::clone(&released)));
        drop(streams);
        assert!(released.load(Ordering::SeqCst));
    }
}
