//! Video Sampler
//!
//! Eigenständig getaktet: einmal pro Intervall das aktuellste Kamerabild
//! nehmen, verkleinern, als JPEG kodieren und an die Session reichen.
//! Kein Bild vorhanden heißt: Tick auslassen.

use super::media::{FrameSource, RawFrame};
use super::session::{CallFault, MediaGate};
use super::stats::CallStats;
use super::task::TaskHandle;
use crate::config::VideoConfig;
use crate::live::{LiveSession, MediaChunk, SessionError};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Verkleinert ein Bild linear um `downscale` und kodiert es als JPEG
pub fn encode_frame(frame: RawFrame, downscale: u32, quality: u8) -> Result<Vec<u8>, VideoError> {
    let (width, height) = (frame.width, frame.height);
    let image = RgbImage::from_raw(width, height, frame.rgb)
        .ok_or(VideoError::InvalidFrame { width, height })?;

    let factor = downscale.max(1);
    let target_w = (width / factor).max(1);
    let target_h = (height / factor).max(1);
    let small = if factor == 1 {
        image
    } else {
        imageops::resize(&image, target_w, target_h, FilterType::Triangle)
    };

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode_image(&small)?;
    Ok(jpeg)
}

/// Ergebnis eines Ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Sent,
    /// Kein Bild, Video aus oder Kodierfehler
    Skipped,
    /// Warteschlange voll
    Dropped,
}

pub struct VideoSampler {
    interval: Duration,
    downscale: u32,
    quality: u8,
    gate: Arc<MediaGate>,
    stats: Arc<CallStats>,
}

impl VideoSampler {
    pub fn new(config: &VideoConfig, gate: Arc<MediaGate>, stats: Arc<CallStats>) -> Self {
        Self {
            interval: config.interval().max(Duration::from_millis(1)),
            downscale: config.downscale,
            quality: config.jpeg_quality,
            gate,
            stats,
        }
    }

    /// Ein Tick: Bild holen, kodieren (im Blocking-Pool) und senden
    pub async fn sample_once(
        &self,
        source: &Arc<dyn FrameSource>,
        session: &dyn LiveSession,
    ) -> Result<SampleOutcome, SessionError> {
        if !self.gate.video_open() {
            return Ok(SampleOutcome::Skipped);
        }

        let Some(frame) = source.latest_frame() else {
            self.stats.frame_skipped();
            tracing::trace!("No camera frame available, skipping tick");
            return Ok(SampleOutcome::Skipped);
        };

        let (downscale, quality) = (self.downscale, self.quality);
        let encoded =
            tokio::task::spawn_blocking(move || encode_frame(frame, downscale, quality)).await;

        let jpeg = match encoded {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                self.stats.frame_skipped();
                tracing::warn!("Skipping video frame: {}", e);
                return Ok(SampleOutcome::Skipped);
            }
            Err(e) => {
                self.stats.frame_skipped();
                tracing::warn!("Video encode task failed: {}", e);
                return Ok(SampleOutcome::Skipped);
            }
        };

        // Gate kann sich während der Kodierung geschlossen haben
        if !self.gate.video_open() {
            return Ok(SampleOutcome::Skipped);
        }

        match session.send_media(MediaChunk::jpeg(&jpeg)) {
            Ok(()) => {
                self.stats.frame_sent();
                tracing::debug!("Video frame sent ({} bytes)", jpeg.len());
                Ok(SampleOutcome::Sent)
            }
            Err(SessionError::QueueFull) => {
                self.stats.frame_skipped();
                tracing::warn!("Outbound queue full, video frame dropped");
                Ok(SampleOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Startet den Sampler als eigenen Task; erster Tick nach einem Intervall
    pub fn spawn(
        self,
        source: Arc<dyn FrameSource>,
        session: Arc<dyn LiveSession>,
        faults: mpsc::UnboundedSender<CallFault>,
    ) -> TaskHandle {
        TaskHandle::spawn("video", async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if let Err(e) = self.sample_once(&source, session.as_ref()).await {
                    tracing::error!("Video sampler stopped: {}", e);
                    let _ = faults.send(CallFault::Transport(e.to_string()));
                    break;
                }
            }
        })
    }
}

impl std::fmt::Debug for VideoSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSampler")
            .field("interval", &self.interval)
            .field("downscale", &self.downscale)
            .field("quality", &self.quality)
            .finish()
    }
}
