//! Message Types für das Live-Protokoll
//!
//! Diese Strukturen bilden das JSON der BidiGenerateContent-Session ab und
//! ermöglichen typsichere Kommunikation.

use super::transport::{SessionEvent, SessionParams};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// MIME-Typ der Kamerabilder
pub const JPEG_MIME: &str = "image/jpeg";

/// MIME-Typ für PCM16 mit gegebener Sample Rate
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

// ============================================================================
// MEDIA CHUNK
// ============================================================================

/// Base64-kodierter Medien-Blob (ausgehend und als `inlineData` eingehend)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    pub fn audio_pcm(pcm: &[u8], sample_rate: u32) -> Self {
        Self {
            mime_type: pcm_mime(sample_rate),
            data: BASE64.encode(pcm),
        }
    }

    pub fn jpeg(jpeg: &[u8]) -> Self {
        Self {
            mime_type: JPEG_MIME.to_string(),
            data: BASE64.encode(jpeg),
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Erste Nachricht nach dem Verbindungsaufbau
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseModality {
    Audio,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl From<&SessionParams> for SetupMessage {
    fn from(params: &SessionParams) -> Self {
        Self {
            setup: Setup {
                model: params.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec![ResponseModality::Audio],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: params.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: params.system_instruction.clone(),
                    }],
                },
            },
        }
    }
}

/// Echtzeit-Eingabe (Audio oder Bild)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

impl RealtimeInputMessage {
    pub fn single(chunk: MediaChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![chunk],
            },
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Server-Nachricht; genau eines der Felder ist typischerweise gesetzt
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<MediaChunk>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    /// Übersetzt die Nachricht in Session-Events, in Protokollreihenfolge
    pub fn into_events(self) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(SessionEvent::Ready);
        }

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        if blob.is_audio() {
                            events.push(SessionEvent::Audio(blob.data));
                        }
                    }
                }
            }
            if content.interrupted {
                events.push(SessionEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(SessionEvent::TurnComplete);
            }
        }

        // goAway beendet die Session, auch wenn der Socket noch offen ist
        if let Some(go_away) = self.go_away {
            let reason = match go_away.time_left {
                Some(left) => format!("goAway (time left: {})", left),
                None => "goAway".to_string(),
            };
            events.push(SessionEvent::Closed {
                reason: Some(reason),
            });
        }

        events
    }
}
