//! Transport-Abstraktion der Live-Session
//!
//! Die Engine kennt nur diese Traits; `GeminiLiveConnector` ist die
//! WebSocket-Implementierung, Tests verwenden eine Attrappe.

use super::messages::MediaChunk;
use crate::call_engine::{MediaKind, RemoteParty};
use crate::config::LiveConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Live connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Live session closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Events der Gegenstelle, vom Call-Task an einer Stelle verarbeitet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Setup bestätigt, Medien dürfen fließen
    Ready,

    /// Audio-Payload (Base64, PCM16)
    Audio(String),

    /// Gegenstelle spricht dazwischen, Wiedergabe verwerfen
    Interrupted,

    /// Antwort der Gegenstelle vollständig
    TurnComplete,

    /// Verbindung geschlossen
    Closed { reason: Option<String> },

    /// Transportfehler
    Error(String),
}

// ============================================================================
// SESSION PARAMETERS
// ============================================================================

/// Parameter beim Öffnen der Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl SessionParams {
    /// Parameter für einen Anruf mit der simulierten Gegenstelle
    pub fn for_call(config: &LiveConfig, remote: &RemoteParty, kind: MediaKind) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: persona_instruction(&config.app_name, remote, kind),
        }
    }
}

/// System-Anweisung, die die Gegenstelle als Persona beschreibt
pub fn persona_instruction(app_name: &str, remote: &RemoteParty, kind: MediaKind) -> String {
    format!(
        "You are {name}, a friendly person on {app}. You are currently in a {kind} call. \
         Be natural, casual, and engage in high-quality conversation. \
         Use the visual input if provided to react to the user's surroundings or appearance.",
        name = remote.display_name,
        app = app_name,
        kind = kind,
    )
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine offene Session
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Reiht einen Medien-Chunk ein, ohne zu blockieren
    ///
    /// Die Reihenfolge der Aufrufe bleibt auf der Leitung erhalten.
    fn send_media(&self, chunk: MediaChunk) -> Result<(), SessionError>;

    /// Schließt die Verbindung
    async fn close(&self);
}

/// Baut Sessions auf
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Öffnet eine Session und liefert den Event-Strom
    ///
    /// `SessionEvent::Ready` folgt, sobald die Gegenstelle das Setup bestätigt.
    async fn connect(
        &self,
        params: SessionParams,
    ) -> Result<(Arc<dyn LiveSession>, mpsc::Receiver<SessionEvent>), SessionError>;
}
