//! PCM16 Konvertierung
//!
//! Ausgehend: Float-Samples [-1.0, 1.0] → i16 little-endian.
//! Eingehend: Base64 → i16 little-endian → Float, pro Kanal de-interleaved.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::time::Duration;
use thiserror::Error;

/// Skalierung zwischen Float und i16
pub const PCM_SCALE: f32 = 32768.0;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    Base64(String),

    #[error("Empty audio payload")]
    Empty,

    #[error("Payload length {0} is not a multiple of 2 bytes")]
    OddLength(usize),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),
}

// ============================================================================
// SAMPLE CONVERSION
// ============================================================================

/// Konvertiert ein Float-Sample nach i16 (gerundet, gesättigt)
pub fn float_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample * PCM_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Konvertiert ein i16-Sample nach Float
pub fn i16_to_float(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

/// Kodiert Float-Samples als PCM16 little-endian
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&float_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Rechnet eine Frame-Anzahl in eine Dauer um
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let nanos = u128::from(frames) * 1_000_000_000 / u128::from(sample_rate.max(1));
    Duration::from_nanos(nanos as u64)
}

/// Rechnet eine Dauer in Frames um (abgerundet)
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * u128::from(sample_rate) / 1_000_000_000) as u64
}

// ============================================================================
// AUDIO BUFFER
// ============================================================================

/// Dekodierter Audio-Puffer, ein Sample-Vektor pro Kanal
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    /// Stille mit gegebener Länge (für Tests und Platzhalter)
    pub fn silence(sample_rate: u32, frames: usize) -> Self {
        Self::mono(sample_rate, vec![0.0; frames])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Interpretiert rohe Bytes als interleaved PCM16
///
/// Ein unvollständiger letzter Frame wird verworfen.
pub fn decode_pcm16(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidChannels(channels));
    }
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let channel_count = channels as usize;
    let frame_count = bytes.len() / 2 / channel_count;
    if frame_count == 0 {
        return Err(DecodeError::Empty);
    }

    let mut data = vec![Vec::with_capacity(frame_count); channel_count];
    for (i, pair) in bytes
        .chunks_exact(2)
        .take(frame_count * channel_count)
        .enumerate()
    {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        data[i % channel_count].push(i16_to_float(sample));
    }

    Ok(AudioBuffer::new(sample_rate, data))
}

/// Dekodiert eine Base64-Payload der Live-Session
pub fn decode_payload(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, DecodeError> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    decode_pcm16(&bytes, sample_rate, channels)
}
