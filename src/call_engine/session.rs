//! Call-Session und Zustandsmaschine
//!
//! Eine `CallSession` gehört exklusiv dem Call-Task der Engine. Sie wird beim
//! Anrufstart erzeugt und beim Abbau verworfen.

use super::engine::CallEngineError;
use crate::config::AudioConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// MEDIA KIND / REMOTE PARTY
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn wants_video(self) -> bool {
        self == MediaKind::Video
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Die simulierte Gegenstelle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParty {
    pub display_name: String,
}

impl RemoteParty {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallState {
    /// Kein Anruf
    Idle,
    /// Geräte werden angefordert, Verbindung wird aufgebaut
    Connecting,
    /// Anruf aktiv, Medien fließen
    Active,
    /// Auflegen läuft
    Closing,
    /// Anruf beendet
    Closed,
    /// Anruf mit Fehler beendet
    Errored,
}

impl CallState {
    /// Connecting oder Active
    pub fn is_live(self) -> bool {
        matches!(self, CallState::Connecting | CallState::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Closed | CallState::Errored)
    }

    /// Erlaubte Übergänge der Zustandsmaschine
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Active)
                | (Connecting, Closing)
                | (Connecting, Errored)
                | (Active, Closing)
                | (Active, Closed)
                | (Active, Errored)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein einzelner Anruf
#[derive(Debug, Clone)]
pub struct CallSession {
    id: Uuid,
    state: CallState,
    media_kind: MediaKind,
    input_sample_rate: u32,
    output_sample_rate: u32,
    channels: u16,
    remote: RemoteParty,
    created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(remote: RemoteParty, media_kind: MediaKind, audio: &AudioConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: CallState::Idle,
            media_kind,
            input_sample_rate: audio.input_sample_rate,
            output_sample_rate: audio.output_sample_rate,
            channels: audio.channels,
            remote,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.input_sample_rate
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn remote(&self) -> &RemoteParty {
        &self.remote
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Führt einen Zustandswechsel durch und gibt den alten Zustand zurück
    pub fn transition(&mut self, next: CallState) -> Result<CallState, CallEngineError> {
        if !self.state.can_transition_to(next) {
            return Err(CallEngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        tracing::info!(call_id = %self.id, "Call state: {:?} -> {:?}", previous, next);
        Ok(previous)
    }
}

// ============================================================================
// MEDIA GATE
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    active: bool,
    muted: bool,
    video_off: bool,
}

/// Gemeinsamer Schalter für Capture Pipeline und Video Sampler
///
/// Audio fließt nur wenn aktiv und nicht stumm, Video nur wenn aktiv und
/// nicht abgeschaltet.
#[derive(Debug, Default)]
pub struct MediaGate {
    state: Mutex<GateState>,
}

impl MediaGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    pub fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn set_video_off(&self, off: bool) {
        self.state.lock().video_off = off;
        tracing::debug!("Video off: {}", off);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn is_video_off(&self) -> bool {
        self.state.lock().video_off
    }

    pub fn audio_open(&self) -> bool {
        let s = self.state.lock();
        s.active && !s.muted
    }

    pub fn video_open(&self) -> bool {
        let s = self.state.lock();
        s.active && !s.video_off
    }
}

// ============================================================================
// FAULTS
// ============================================================================

/// Fehler, die Hintergrund-Tasks und Geräte-Callbacks an den Call-Task melden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFault {
    /// Senden an die Live-Session fehlgeschlagen
    Transport(String),
    /// Audio- oder Video-Gerät verloren
    DeviceLost(String),
}
