//! Live Module - WebSocket Client für die Gemini Live API
//!
//! Dieses Modul verwaltet die bidirektionale Session mit der Gegenstelle:
//! - Verbindung aufbauen und Setup senden
//! - Audio-Chunks und Kamerabilder senden (nicht blockierend)
//! - Server-Nachrichten in `SessionEvent`s übersetzen

mod client;
mod messages;
mod transport;

pub use client::GeminiLiveConnector;
pub use messages::*;
pub use transport::{
    persona_instruction, LiveConnector, LiveSession, SessionError, SessionEvent, SessionParams,
};
