//! Kamera über nokhwa
//!
//! Die Kamera läuft in einem eigenen Thread und legt jedes Bild als
//! "aktuellstes Bild" ab. Der Video Sampler holt es sich in seinem Takt.

use super::media::{FrameSource, MediaError, RawFrame};
use super::session::CallFault;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// Aufeinanderfolgende Fehlbilder, ab denen die Kamera als verloren gilt
const MAX_FRAME_ERRORS: u32 = 50;

/// Pause nach einem Fehlbild
const ERROR_BACKOFF: Duration = Duration::from_millis(20);

/// Zuletzt aufgenommenes Bild
#[derive(Debug, Default)]
pub struct LatestFrame {
    frame: Mutex<Option<RawFrame>>,
}

impl LatestFrame {
    fn store(&self, frame: RawFrame) {
        *self.frame.lock() = Some(frame);
    }
}

impl FrameSource for LatestFrame {
    fn latest_frame(&self) -> Option<RawFrame> {
        self.frame.lock().clone()
    }
}

/// Zählt Fehlbilder in Folge und meldet den Verlust der Kamera
struct FrameErrors {
    consecutive: u32,
    limit: u32,
    faults: mpsc::UnboundedSender<CallFault>,
}

impl FrameErrors {
    fn new(limit: u32, faults: mpsc::UnboundedSender<CallFault>) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
            faults,
        }
    }

    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// `true`: Kamera verloren, Fault ist gemeldet
    fn failed(&mut self, error: &str) -> bool {
        self.consecutive += 1;
        tracing::debug!("Camera frame error ({}): {}", self.consecutive, error);
        if self.consecutive < self.limit {
            return false;
        }

        tracing::error!("Camera lost after {} failed frames: {}", self.consecutive, error);
        let _ = self
            .faults
            .send(CallFault::DeviceLost(format!("camera: {}", error)));
        true
    }
}

/// Laufende Kamera; Drop stoppt den Thread und gibt das Gerät frei
pub struct CameraCapture {
    stop: Arc<AtomicBool>,
    latest: Arc<LatestFrame>,
    thread: Option<JoinHandle<()>>,
}

impl CameraCapture {
    /// Öffnet die Standardkamera (blockierend)
    ///
    /// Liefert die Kamera dauerhaft keine Bilder mehr, geht ein
    /// `CallFault::DeviceLost` an `faults`.
    pub fn open(faults: mpsc::UnboundedSender<CallFault>) -> Result<Self, MediaError> {
        let stop = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(LatestFrame::default());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();

        let thread_stop = Arc::clone(&stop);
        let thread_latest = Arc::clone(&latest);
        let thread = std::thread::Builder::new()
            .name("camera".into())
            .spawn(move || {
                let requested =
                    RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
                let mut camera = match Camera::new(CameraIndex::Index(0), requested) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = ready_tx.send(Err(MediaError::PermissionDenied(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = camera.open_stream() {
                    let _ = ready_tx.send(Err(MediaError::Camera(e.to_string())));
                    return;
                }

                let format = camera.camera_format();
                tracing::info!(
                    "Camera started: {}x{} @{}",
                    format.resolution().width(),
                    format.resolution().height(),
                    format.frame_rate()
                );
                let _ = ready_tx.send(Ok(()));

                let mut errors = FrameErrors::new(MAX_FRAME_ERRORS, faults);
                while !thread_stop.load(Ordering::Acquire) {
                    let image = match camera.frame().and_then(|b| b.decode_image::<RgbFormat>()) {
                        Ok(image) => image,
                        Err(e) => {
                            if errors.failed(&e.to_string()) {
                                break;
                            }
                            std::thread::sleep(ERROR_BACKOFF);
                            continue;
                        }
                    };
                    errors.succeeded();
                    let (width, height) = image.dimensions();
                    thread_latest.store(RawFrame {
                        width,
                        height,
                        rgb: image.into_raw(),
                    });
                }

                let _ = camera.stop_stream();
                tracing::info!("Camera stopped");
            })
            .map_err(|e| MediaError::Camera(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| MediaError::Camera("camera thread exited".to_string()))?;

        let mut capture = Self {
            stop,
            latest,
            thread: Some(thread),
        };
        if let Err(e) = ready {
            capture.shutdown();
            return Err(e);
        }
        Ok(capture)
    }

    pub fn source(&self) -> Arc<dyn FrameSource> {
        Arc::clone(&self.latest) as Arc<dyn FrameSource>
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}
