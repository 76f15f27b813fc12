//! Capture Pipeline
//!
//! Sammelt rohe Mono-Frames in festen Fenstern (Standard 4096 Samples bei
//! 16 kHz), kodiert jedes Fenster als PCM16 und reicht es nicht blockierend
//! an die Live-Session weiter. Stumm oder inaktiv: das Fenster wird verworfen.

use super::pcm::encode_pcm16;
use super::session::{CallFault, MediaGate};
use super::stats::{rms, AudioLevels, CallStats};
use super::task::TaskHandle;
use crate::config::AudioConfig;
use crate::live::{LiveSession, MediaChunk, SessionError};
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// AUDIO CHUNK
// ============================================================================

/// Ein kodiertes Fenster: PCM16 little-endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pcm: Vec<u8>,
    samples: usize,
}

impl AudioChunk {
    pub fn encode(window: &[f32]) -> Self {
        Self {
            pcm: encode_pcm16(window),
            samples: window.len(),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn to_media(&self, sample_rate: u32) -> MediaChunk {
        MediaChunk::audio_pcm(&self.pcm, sample_rate)
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct CapturePipeline {
    window_size: usize,
    sample_rate: u32,
    pending: HeapRb<f32>,
    window: Vec<f32>,
    gate: Arc<MediaGate>,
    levels: Arc<AudioLevels>,
    stats: Arc<CallStats>,
}

impl CapturePipeline {
    pub fn new(
        config: &AudioConfig,
        gate: Arc<MediaGate>,
        levels: Arc<AudioLevels>,
        stats: Arc<CallStats>,
    ) -> Self {
        let window_size = config.capture_window.max(1);
        tracing::debug!(
            "Capture window: {} samples ({:?})",
            window_size,
            config.window_duration()
        );
        Self {
            window_size,
            sample_rate: config.input_sample_rate,
            pending: HeapRb::new(window_size * 2),
            window: vec![0.0; window_size],
            gate,
            levels,
            stats,
        }
    }

    /// Nimmt rohe Frames auf; gibt die Anzahl fertiger Fenster zurück
    ///
    /// Ein Fehler bedeutet, dass die Session nicht mehr sendet.
    pub fn push_frames(
        &mut self,
        mut frames: &[f32],
        session: &dyn LiveSession,
    ) -> Result<usize, SessionError> {
        let mut windows = 0;
        while !frames.is_empty() {
            let written = self.pending.push_slice(frames);
            frames = &frames[written..];

            while self.pending.occupied_len() >= self.window_size {
                self.pending.pop_slice(&mut self.window);
                self.process_window(session)?;
                windows += 1;
            }
        }
        Ok(windows)
    }

    /// Noch nicht zu einem Fenster gefüllte Samples
    pub fn pending_samples(&self) -> usize {
        self.pending.occupied_len()
    }

    fn process_window(&mut self, session: &dyn LiveSession) -> Result<(), SessionError> {
        self.levels.set_input(rms(&self.window));

        if !self.gate.audio_open() {
            // Nichts senden, auch keine Stille
            self.stats.chunk_muted();
            return Ok(());
        }

        let chunk = AudioChunk::encode(&self.window);
        match session.send_media(chunk.to_media(self.sample_rate)) {
            Ok(()) => {
                self.stats.chunk_sent();
                tracing::trace!("Audio chunk sent ({} samples)", chunk.samples());
                Ok(())
            }
            Err(SessionError::QueueFull) => {
                self.stats.chunk_dropped();
                tracing::warn!("Outbound queue full, audio chunk dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Startet die Pipeline als eigenen Task
    pub fn spawn(
        mut self,
        mut frames: mpsc::Receiver<Vec<f32>>,
        session: Arc<dyn LiveSession>,
        faults: mpsc::UnboundedSender<CallFault>,
    ) -> TaskHandle {
        TaskHandle::spawn("capture", async move {
            while let Some(block) = frames.recv().await {
                if let Err(e) = self.push_frames(&block, session.as_ref()) {
                    tracing::error!("Audio capture stopped: {}", e);
                    let _ = faults.send(CallFault::Transport(e.to_string()));
                    return;
                }
            }

            // Mikrofon-Kanal zu, während der Anruf noch läuft
            if self.gate.is_active() {
                tracing::error!("Microphone stream ended unexpectedly");
                let _ = faults.send(CallFault::DeviceLost(
                    "microphone stream ended".to_string(),
                ));
            } else {
                tracing::debug!("Capture pipeline finished");
            }
        })
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("window_size", &self.window_size)
            .field("sample_rate", &self.sample_rate)
            .field("pending", &self.pending.occupied_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::pcm::decode_payload;
    use crate::test_utils::{wait_until, MockSession};

    fn pipeline(window: usize) -> (CapturePipeline, Arc<MediaGate>, Arc<CallStats>) {
        let config = AudioConfig {
            capture_window: window,
            ..AudioConfig::default()
        };
        let gate = Arc::new(MediaGate::new());
        gate.set_active(true);
        let stats = Arc::new(CallStats::default());
        let pipeline = CapturePipeline::new(
            &config,
            Arc::clone(&gate),
            Arc::new(AudioLevels::default()),
            Arc::clone(&stats),
        );
        (pipeline, gate, stats)
    }

    #[test]
    fn chunk_encodes_little_endian() {
        let chunk = AudioChunk::encode(&[0.5, -1.0]);
        assert_eq!(chunk.samples(), 2);
        assert_eq!(chunk.as_bytes(), &[0x00, 0x40, 0x00, 0x80]);
        assert_eq!(chunk.to_media(16_000).mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn emits_one_chunk_per_full_window() {
        let (mut pipeline, _gate, stats) = pipeline(4096);
        let session = MockSession::default();

        assert_eq!(pipeline.push_frames(&vec![0.25; 3000], &session), Ok(0));
        assert_eq!(pipeline.push_frames(&vec![0.25; 3000], &session), Ok(1));
        assert_eq!(pipeline.pending_samples(), 6000 - 4096);

        let sent = session.sent_with_mime("audio/pcm;rate=16000");
        assert_eq!(sent.len(), 1);
        let decoded = decode_payload(&sent[0].data, 16_000, 1).unwrap();
        assert_eq!(decoded.frames(), 4096);
        assert_eq!(stats.snapshot().chunks_sent, 1);
    }

    #[test]
    fn large_block_spans_several_windows() {
        let (mut pipeline, _gate, _stats) = pipeline(256);
        let session = MockSession::default();

        assert_eq!(pipeline.push_frames(&vec![0.1; 256 * 5 + 10], &session), Ok(5));
        assert_eq!(session.sent.lock().len(), 5);
        assert_eq!(pipeline.pending_samples(), 10);
    }

    #[test]
    fn mute_suppresses_capture() {
        let (mut pipeline, gate, stats) = pipeline(128);
        let session = MockSession::default();
        gate.set_muted(true);

        pipeline.push_frames(&vec![0.9; 128 * 4], &session).unwrap();
        assert!(session.sent.lock().is_empty());
        assert_eq!(stats.snapshot().chunks_muted, 4);

        gate.set_muted(false);
        pipeline.push_frames(&vec![0.9; 128], &session).unwrap();
        assert_eq!(session.sent.lock().len(), 1);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (mut pipeline, _gate, stats) = pipeline(64);
        let session = MockSession::default();
        *session.capacity.lock() = Some(2);

        assert_eq!(pipeline.push_frames(&vec![0.0; 64 * 5], &session), Ok(5));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks_sent, 2);
        assert_eq!(snapshot.chunks_dropped, 3);
    }

    #[test]
    fn closed_session_is_an_error() {
        let (mut pipeline, _gate, _stats) = pipeline(64);
        let session = MockSession::default();
        session
            .closed
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert_eq!(
            pipeline.push_frames(&vec![0.0; 64], &session),
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn stray_frames_after_gate_closes_are_not_sent() {
        let (pipeline, gate, _stats) = pipeline(32);
        let session = Arc::new(MockSession::default());
        let (tx, rx) = mpsc::channel(8);
        let (faults_tx, _faults_rx) = mpsc::unbounded_channel();

        let task = pipeline.spawn(rx, session.clone(), faults_tx);
        tx.send(vec![0.3; 32]).await.unwrap();
        assert!(wait_until(|| session.sent.lock().len() == 1).await);

        gate.set_active(false);
        tx.send(vec![0.3; 32 * 3]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(session.sent.lock().len(), 1);

        task.stop().await;
    }

    #[tokio::test]
    async fn closed_microphone_reports_device_loss() {
        let (pipeline, _gate, _stats) = pipeline(32);
        let session = Arc::new(MockSession::default());
        let (tx, rx) = mpsc::channel(8);
        let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();

        let task = pipeline.spawn(rx, session, faults_tx);
        drop(tx);

        assert!(matches!(
            faults_rx.recv().await,
            Some(CallFault::DeviceLost(_))
        ));
        assert!(wait_until(|| task.is_finished()).await);
    }

    #[tokio::test]
    async fn microphone_closed_during_teardown_is_quiet() {
        let (pipeline, gate, _stats) = pipeline(32);
        let session = Arc::new(MockSession::default());
        let (tx, rx) = mpsc::channel(8);
        let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();

        let task = pipeline.spawn(rx, session, faults_tx);
        gate.set_active(false);
        drop(tx);

        assert!(wait_until(|| task.is_finished()).await);
        assert!(faults_rx.try_recv().is_err());
    }
}
