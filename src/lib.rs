//! Lumina Call - Live-Anrufe mit einer simulierten Gegenstelle
//!
//! Eine Call-Engine für Audio- und Video-Anrufe mit:
//! - cpal für Mikrofon und Lautsprecher, nokhwa für die Kamera (optional)
//! - Gemini Live als Gegenstelle über WebSocket
//! - Lückenloser Wiedergabe mit Barge-in
//!
//! Einstiegspunkt ist [`CallEngine`].

pub mod call_engine;
pub mod config;
pub mod live;

#[cfg(test)]
pub(crate) mod test_utils;

pub use call_engine::{
    CallEngine, CallEngineError, CallError, CallEvent, CallState, MediaKind, RemoteParty,
    StatsSnapshot,
};
pub use config::{CallConfig, ConfigError};

/// Initialisiert das Logging (einmalig, weitere Aufrufe sind wirkungslos)
///
/// Filter aus `RUST_LOG`, ergänzt um die Standard-Direktiven.
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["lumina_call=debug", "tungstenite=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
