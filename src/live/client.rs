//! WebSocket Client für die Live-Session
//!
//! Verwaltet die WebSocket-Verbindung zur Gemini Live API:
//! - Setup-Nachricht mit Stimme und Persona
//! - Write-Task mit begrenzter Warteschlange (Reihenfolge bleibt erhalten)
//! - Read-Task übersetzt Server-Nachrichten in `SessionEvent`s

use super::messages::*;
use super::transport::{LiveConnector, LiveSession, SessionError, SessionEvent, SessionParams};
use crate::config::LiveConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Kapazität des Event-Kanals zum Call-Task
const EVENT_QUEUE: usize = 64;

/// Wartezeit für den Close-Frame beim Auflegen
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// CONNECTOR
// ============================================================================

/// Baut Sessions gegen die Gemini Live API auf
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: Option<String>,
    outbound_queue: usize,
}

impl GeminiLiveConnector {
    pub fn new(config: &LiveConfig, outbound_queue: usize) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            outbound_queue: outbound_queue.max(1),
        }
    }

    /// Endpunkt inklusive API-Key als Query-Parameter
    fn session_url(&self) -> Result<Url, SessionError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|e| SessionError::InvalidEndpoint(e.to_string()))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SessionError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    /// Verarbeitet eine eingehende Nachricht; `false` beendet den Read-Task
    ///
    /// Nach einem `Closed` (goAway) kommen keine weiteren Events.
    async fn forward_server_message(
        payload: &[u8],
        event_tx: &mpsc::Sender<SessionEvent>,
    ) -> bool {
        let msg = match serde_json::from_slice::<ServerMessage>(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Ignoring malformed server message: {}", e);
                return true;
            }
        };

        if let Some(go_away) = &msg.go_away {
            tracing::info!("Server announced shutdown (time left: {:?})", go_away.time_left);
        }

        for event in msg.into_events() {
            let closing = matches!(event, SessionEvent::Closed { .. });
            if event_tx.send(event).await.is_err() {
                // Call-Task ist weg
                return false;
            }
            if closing {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for GeminiLiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConnector")
            .field("endpoint", &self.endpoint)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        params: SessionParams,
    ) -> Result<(Arc<dyn LiveSession>, mpsc::Receiver<SessionEvent>), SessionError> {
        let url = self.session_url()?;

        tracing::info!(
            "Connecting to live endpoint: {}{}",
            url.host_str().unwrap_or_default(),
            url.path()
        );

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Setup muss die erste Nachricht sein
        let setup = serde_json::to_string(&SetupMessage::from(&params))
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        tracing::debug!("Setup sent (model {}, voice {})", params.model, params.voice);

        let (tx, mut rx) = mpsc::channel::<Message>(self.outbound_queue);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_QUEUE);

        // Read-Task starten
        let reader = tokio::spawn(async move {
            let mut terminal = None;
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if !Self::forward_server_message(text.as_bytes(), &event_tx).await {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if !Self::forward_server_message(&data, &event_tx).await {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        tracing::info!("Live session closed by server: {:?}", reason);
                        terminal = Some(SessionEvent::Closed { reason });
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Live session error: {}", e);
                        terminal = Some(SessionEvent::Error(e.to_string()));
                        break;
                    }
                    _ => {}
                }
            }

            let event = terminal.unwrap_or(SessionEvent::Closed { reason: None });
            let _ = event_tx.send(event).await;
        });

        // Write-Task starten
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send live message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let session = WsLiveSession {
            tx,
            open: AtomicBool::new(true),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        };

        Ok((Arc::new(session), event_rx))
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Offene WebSocket-Session
struct WsLiveSession {
    tx: mpsc::Sender<Message>,
    open: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl LiveSession for WsLiveSession {
    fn send_media(&self, chunk: MediaChunk) -> Result<(), SessionError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let text = serde_json::to_string(&RealtimeInputMessage::single(chunk))
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        self.tx
            .try_send(Message::Text(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => SessionError::QueueFull,
                TrySendError::Closed(_) => SessionError::Closed,
            })
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        // Reader wird nicht mehr gebraucht
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let writer = self.writer.lock().take();
        match (self.tx.try_send(Message::Close(None)), writer) {
            (Ok(()), Some(writer)) => {
                // Close-Frame noch rausschreiben lassen
                if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                    tracing::warn!("Live writer did not finish in time");
                }
            }
            (Err(_), Some(writer)) => writer.abort(),
            (_, None) => {}
        }

        tracing::info!("Live session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(endpoint: &str, key: Option<&str>) -> GeminiLiveConnector {
        let config = LiveConfig {
            endpoint: endpoint.to_string(),
            api_key: key.map(str::to_string),
            ..LiveConfig::default()
        };
        GeminiLiveConnector::new(&config, 8)
    }

    #[test]
    fn url_carries_api_key() {
        let url = connector("wss://example.com/ws/live", Some("abc 123"))
            .session_url()
            .unwrap();
        assert_eq!(url.as_str(), "wss://example.com/ws/live?key=abc+123");
    }

    #[test]
    fn url_without_key() {
        let url = connector("ws://localhost:9000/live", None).session_url().unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn http_endpoint_is_rejected() {
        let err = connector("https://example.com", None).session_url().unwrap_err();
        assert!(matches!(err, SessionError::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn malformed_server_message_is_skipped() {
        let (tx, mut rx) = mpsc::channel(4);
        assert!(GeminiLiveConnector::forward_server_message(b"{oops", &tx).await);
        assert!(
            GeminiLiveConnector::forward_server_message(br#"{"setupComplete":{}}"#, &tx).await
        );
        assert_eq!(rx.recv().await, Some(SessionEvent::Ready));
    }

    #[tokio::test]
    async fn forwarding_stops_when_call_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        assert!(
            !GeminiLiveConnector::forward_server_message(br#"{"setupComplete":{}}"#, &tx).await
        );
    }

    #[tokio::test]
    async fn go_away_ends_forwarding() {
        let (tx, mut rx) = mpsc::channel(4);
        assert!(
            !GeminiLiveConnector::forward_server_message(
                br#"{"goAway":{"timeLeft":"5s"}}"#,
                &tx
            )
            .await
        );
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Closed { reason: Some(_) })
        ));
    }

    #[tokio::test]
    async fn closed_session_rejects_media() {
        let (tx, mut rx) = mpsc::channel(1);
        let session = WsLiveSession {
            tx,
            open: AtomicBool::new(true),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        };

        session.send_media(MediaChunk::jpeg(&[1])).unwrap();
        assert_eq!(
            session.send_media(MediaChunk::jpeg(&[2])),
            Err(SessionError::QueueFull)
        );
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));

        session.close().await;
        assert_eq!(
            session.send_media(MediaChunk::jpeg(&[3])),
            Err(SessionError::Closed)
        );
    }
}
