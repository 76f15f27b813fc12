//! Audio I/O - Mikrofon Capture und Wiedergabe
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Der Input-Callback macht nur
//! Downmix und Resampling und reicht die Frames nicht blockierend weiter; das
//! Fenstern übernimmt die Capture Pipeline. Die Wiedergabe mischt geplante
//! Einheiten frame-genau auf der Uhr des Ausgabegeräts.

use super::media::OutputRequest;
use super::pcm::{duration_to_frames, frames_to_duration, AudioBuffer};
use super::playback::{AudioOutput, UnitId};
use super::session::CallFault;
use super::stats::{rms, AudioLevels};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// MICROPHONE
// ============================================================================

/// Laufende Mikrofon-Aufnahme; Drop stoppt den Stream
pub struct MicrophoneCapture {
    _stream: Stream,
}

// Stream ist nicht Send, wird aber nur gehalten und gedroppt
unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    /// Startet die Aufnahme, liefert Mono-Frames mit `target_rate`
    pub fn start(
        target_rate: u32,
        frames_tx: mpsc::Sender<Vec<f32>>,
        faults: mpsc::UnboundedSender<CallFault>,
    ) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect(), target_rate)?;

        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels -> {} Hz mono",
            device_rate,
            channels,
            target_rate
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    let samples = resample_linear(&mono, device_rate, target_rate);
                    if samples.is_empty() {
                        return;
                    }
                    // Nie blockieren; ist der Kanal voll, fällt der Block weg
                    if frames_tx.try_send(samples).is_err() {
                        tracing::trace!("Capture channel full, dropping block");
                    }
                },
                move |err| {
                    tracing::error!("Audio capture error: {}", err);
                    let _ = faults.send(CallFault::DeviceLost(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self { _stream: stream })
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        tracing::info!("Audio capture stopped");
    }
}

// ============================================================================
// MIXER
// ============================================================================

struct Voice {
    id: UnitId,
    start_frame: u64,
    channels: Vec<Vec<f32>>,
}

impl Voice {
    fn len(&self) -> u64 {
        self.channels.first().map_or(0, |c| c.len()) as u64
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.len()
    }

    /// Sample für einen Ausgabekanal; fehlende Kanäle nehmen den letzten
    fn sample(&self, channel: usize, index: usize) -> f32 {
        let last = self.channels.len().saturating_sub(1);
        self.channels
            .get(channel.min(last))
            .and_then(|c| c.get(index))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Lückenlose Folge von Einheiten, in Quell-Frames gezählt
///
/// Ende einer Einheit = `origin_frame + round(source_frames * rate / source_rate)`,
/// damit Rundungsfehler sich nicht aufsummieren.
struct Chain {
    end_at: Duration,
    origin_frame: u64,
    source_frames: u64,
    source_rate: u32,
}

/// Mischt geplante Einheiten auf der Frame-Uhr des Geräts
struct Mixer {
    voices: Vec<Voice>,
    frames_rendered: u64,
    channels: usize,
    rate: u32,
    chain: Option<Chain>,
}

impl Mixer {
    fn new(channels: usize, rate: u32) -> Self {
        Self {
            voices: Vec::new(),
            frames_rendered: 0,
            channels: channels.max(1),
            rate: rate.max(1),
            chain: None,
        }
    }

    /// Startframe und Länge (in Geräte-Frames) für einen Puffer bei `at`
    ///
    /// Beginnt `at` genau am Ende der vorherigen Einheit, schließt die neue
    /// frame-genau an.
    fn place(&mut self, at: Duration, buffer: &AudioBuffer) -> (u64, usize) {
        let source_rate = buffer.sample_rate().max(1);
        let contiguous = self
            .chain
            .as_ref()
            .is_some_and(|c| c.end_at == at && c.source_rate == source_rate);
        if !contiguous {
            self.chain = None;
        }

        let origin_frame = duration_to_frames(at, self.rate).max(self.frames_rendered);
        let rate = self.rate;
        let chain = self.chain.get_or_insert_with(|| Chain {
            end_at: at,
            origin_frame,
            source_frames: 0,
            source_rate,
        });

        let start = chain.origin_frame + scale_frames(chain.source_frames, source_rate, rate);
        chain.source_frames += buffer.frames() as u64;
        let end = chain.origin_frame + scale_frames(chain.source_frames, source_rate, rate);
        chain.end_at = at + buffer.duration();

        (start, (end - start) as usize)
    }

    fn add(&mut self, id: UnitId, start_frame: u64, channels: Vec<Vec<f32>>) {
        self.voices.push(Voice {
            id,
            start_frame,
            channels,
        });
    }

    fn remove(&mut self, id: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Füllt `out` (interleaved) und meldet fertige Einheiten
    fn render(&mut self, out: &mut [f32], finished: &mut Vec<UnitId>) -> f32 {
        out.fill(0.0);
        let frames = out.len() / self.channels;
        let block_start = self.frames_rendered;
        let block_end = block_start + frames as u64;

        for voice in &self.voices {
            if voice.start_frame >= block_end || voice.end_frame() <= block_start {
                continue;
            }
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for pos in from..to {
                let i = (pos - block_start) as usize;
                let idx = (pos - voice.start_frame) as usize;
                for c in 0..self.channels {
                    out[i * self.channels + c] += voice.sample(c, idx);
                }
            }
        }

        self.frames_rendered = block_end;
        self.voices.retain(|v| {
            let done = v.end_frame() <= block_end;
            if done {
                finished.push(v.id);
            }
            !done
        });

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        rms(out)
    }
}

// ============================================================================
// DEVICE OUTPUT
// ============================================================================

/// Ausgabegerät; die Uhr zählt die gerenderten Frames
pub struct DeviceOutput {
    stream: Option<Stream>,
    mixer: Arc<Mutex<Mixer>>,
    device_rate: u32,
}

// Stream ist nicht Send, wird aber nur aus dem Call-Task bedient
unsafe impl Send for DeviceOutput {}

impl DeviceOutput {
    pub fn open(request: OutputRequest) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect(), request.sample_rate)?;

        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            device_rate,
            channels
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(channels, device_rate)));
        let render_mixer = Arc::clone(&mixer);
        let levels = Arc::clone(&request.levels);
        let completions = request.completions;
        let faults = request.faults;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut finished = Vec::new();
                    let level = render_mixer.lock().render(data, &mut finished);
                    levels.set_output(level);
                    for id in finished {
                        let _ = completions.send(id);
                    }
                },
                move |err| {
                    tracing::error!("Audio playback error: {}", err);
                    let _ = faults.send(CallFault::DeviceLost(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            mixer,
            device_rate,
        })
    }
}

impl AudioOutput for DeviceOutput {
    fn now(&self) -> Duration {
        frames_to_duration(self.mixer.lock().frames_rendered, self.device_rate)
    }

    fn start(&mut self, id: UnitId, buffer: AudioBuffer, at: Duration) {
        let (start_frame, frames) = self.mixer.lock().place(at, &buffer);
        // Resampling ausserhalb des Locks, der Render-Callback wartet sonst
        let channels = (0..buffer.channel_count())
            .map(|c| resample_to_len(buffer.channel(c), frames))
            .collect();
        self.mixer.lock().add(id, start_frame, channels);
    }

    fn stop(&mut self, id: UnitId) {
        self.mixer.lock().remove(id);
    }

    fn close(&mut self) {
        {
            let mut mixer = self.mixer.lock();
            mixer.voices.clear();
            mixer.chain = None;
        }
        if self.stream.take().is_some() {
            tracing::info!("Audio playback stopped");
        }
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Mittelt interleaved Frames zu Mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
pub fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f64 / source_rate as f64;
    let new_len = (data.len() as f64 * ratio).round() as usize;
    resample_to_len(data, new_len)
}

/// Linear-Resampling auf eine feste Länge
pub fn resample_to_len(data: &[f32], len: usize) -> Vec<f32> {
    if data.len() == len {
        return data.to_vec();
    }
    if data.is_empty() {
        return vec![0.0; len];
    }
    let step = data.len() as f64 / len as f64;
    (0..len)
        .map(|i| {
            let src_idx = i as f64 * step;
            let idx = src_idx as usize;
            let frac = (src_idx - idx as f64) as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Rechnet Frames von `from` nach `to` um (gerundet)
fn scale_frames(frames: u64, from: u32, to: u32) -> u64 {
    let from = u128::from(from.max(1));
    ((u128::from(frames) * u128::from(to) + from / 2) / from) as u64
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: Zielrate > höchste Rate, F32 > andere.
pub fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(target_rate);
    let supports = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    // Exakt die Zielrate in F32
    if let Some(config) = configs
        .iter()
        .find(|c| supports(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    // Fallback auf beste F32-Konfiguration
    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        let rate = if supports(config) {
            target_rate
        } else {
            config.max_sample_rate()
        };
        return Ok(config.clone().with_sample_rate(rate).into());
    }

    // Erste verfügbare Konfiguration
    if let Some(config) = configs.first() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}
