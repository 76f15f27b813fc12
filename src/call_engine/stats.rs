//! Zähler pro Anruf

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Laufende Zähler, von mehreren Tasks beschrieben
#[derive(Debug, Default)]
pub struct CallStats {
    chunks_sent: AtomicU64,
    chunks_muted: AtomicU64,
    chunks_dropped: AtomicU64,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    buffers_scheduled: AtomicU64,
    buffers_completed: AtomicU64,
    decode_errors: AtomicU64,
    interruptions: AtomicU64,
}

/// Momentaufnahme der Zähler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub chunks_sent: u64,
    /// Fenster verworfen wegen Mute oder inaktiver Session
    pub chunks_muted: u64,
    /// Fenster verworfen wegen voller Warteschlange
    pub chunks_dropped: u64,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub buffers_scheduled: u64,
    /// Vollständig abgespielte Puffer
    pub buffers_completed: u64,
    pub decode_errors: u64,
    pub interruptions: u64,
}

impl CallStats {
    pub fn chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_muted(&self) {
        self.chunks_muted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_scheduled(&self) {
        self.buffers_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_completed(&self) {
        self.buffers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_muted: self.chunks_muted.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            buffers_completed: self.buffers_completed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

/// Audio-Pegel (0.0 - 1.0) für Visualisierung
#[derive(Debug, Default)]
pub struct AudioLevels {
    input: Mutex<f32>,
    output: Mutex<f32>,
}

impl AudioLevels {
    pub fn set_input(&self, level: f32) {
        *self.input.lock() = level.clamp(0.0, 1.0);
    }

    pub fn set_output(&self, level: f32) {
        *self.output.lock() = level.clamp(0.0, 1.0);
    }

    /// Gibt die Pegel zurück (input, output)
    pub fn get(&self) -> (f32, f32) {
        (*self.input.lock(), *self.output.lock())
    }

    pub fn reset(&self) {
        self.set_input(0.0);
        self.set_output(0.0);
    }
}

/// RMS eines Sample-Blocks
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = CallStats::default();
        stats.chunk_sent();
        stats.chunk_sent();
        stats.chunk_muted();
        stats.decode_error();

        let snap = stats.snapshot();
        assert_eq!(snap.chunks_sent, 2);
        assert_eq!(snap.chunks_muted, 1);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.frames_sent, 0);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn levels_are_clamped() {
        let levels = AudioLevels::default();
        levels.set_input(3.0);
        levels.set_output(-1.0);
        assert_eq!(levels.get(), (1.0, 0.0));
    }
}
