//! Call Engine Module - Live-Anruf mit Audio und Video
//!
//! Dieses Modul verwaltet:
//! - Geräte (Mikrofon, Kamera, Lautsprecher)
//! - Capture Pipeline (PCM16-Fenster) und Video Sampler (JPEG)
//! - Playback Scheduler mit Barge-in
//! - Die Zustandsmaschine eines Anrufs

mod audio;
#[cfg(feature = "camera")]
mod camera;
mod capture;
mod engine;
pub mod media;
pub mod pcm;
pub mod playback;
mod session;
mod stats;
mod task;
mod video;

pub use audio::{downmix, resample_linear, AudioError, DeviceOutput, MicrophoneCapture};
#[cfg(feature = "camera")]
pub use camera::CameraCapture;
pub use capture::{AudioChunk, CapturePipeline};
pub use engine::{CallEngine, CallEngineError, CallError, CallEvent};
pub use media::{
    CaptureRequest, FrameSource, MediaDevices, MediaError, MediaStreams, OutputRequest, RawFrame,
    SystemMedia, CAMERA_SUPPORTED,
};
pub use pcm::{AudioBuffer, DecodeError};
pub use playback::{AudioOutput, PlaybackScheduler, PlaybackUnit, UnitId};
pub use session::{CallFault, CallSession, CallState, MediaGate, MediaKind, RemoteParty};
pub use stats::{AudioLevels, CallStats, StatsSnapshot};
pub use task::TaskHandle;
pub use video::{encode_frame, SampleOutcome, VideoError, VideoSampler};
