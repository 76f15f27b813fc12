//! Konfiguration der Call-Engine
//!
//! Wird aus `config.json` im Plattform-Konfigurationsverzeichnis geladen.
//! Fehlende Felder fallen auf die Standardwerte zurück, der API-Key kann
//! per Umgebungsvariable überschrieben werden.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// WebSocket-Endpunkt der Gemini Live API
pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Modell mit nativer Audio-Ausgabe
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Vorgefertigte Stimme
pub const DEFAULT_VOICE: &str = "Kore";

/// Umgebungsvariablen für den API-Key, in dieser Reihenfolge
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No API key configured (set GEMINI_API_KEY)")]
    MissingApiKey,
}

// ============================================================================
// CONFIG SECTIONS
// ============================================================================

/// Gesamte Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
}

/// Verbindung zur Live-Session
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub api_key: Option<String>,
    /// Plattform-Name für die Persona ("a friendly person on ...")
    pub app_name: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            api_key: None,
            app_name: "Lumina".to_string(),
        }
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("app_name", &self.app_name)
            .finish()
    }
}

/// Audio-Parameter (Capture und Wiedergabe)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample Rate der gesendeten Chunks
    pub input_sample_rate: u32,
    /// Sample Rate der empfangenen Payloads
    pub output_sample_rate: u32,
    pub channels: u16,
    /// Samples pro Capture-Fenster
    pub capture_window: usize,
    /// Kapazität der ausgehenden Warteschlange (Nachrichten)
    pub outbound_queue: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            channels: 1,
            capture_window: 4096,
            outbound_queue: 64,
        }
    }
}

impl AudioConfig {
    /// Echtzeit-Budget eines Capture-Fensters
    pub fn window_duration(&self) -> Duration {
        Duration::from_nanos(
            self.capture_window as u64 * 1_000_000_000 / u64::from(self.input_sample_rate.max(1)),
        )
    }
}

/// Video-Sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub interval_ms: u64,
    /// Linearer Verkleinerungsfaktor
    pub downscale: u32,
    pub jpeg_quality: u8,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            downscale: 4,
            jpeg_quality: 50,
        }
    }
}

impl VideoConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl CallConfig {
    /// Lädt die Konfiguration aus dem Standardpfad
    ///
    /// Existiert keine Datei, werden die Standardwerte verwendet.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            tracing::info!("Loading config from {:?}", path);
            Self::load_from_file(&path)?
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Lädt die Konfiguration aus einer bestimmten Datei
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("app", "lumina", "lumina-call")
            .ok_or(ConfigError::NoConfigDir)?;

        Ok(proj_dirs.config_dir().join("config.json"))
    }

    /// Übernimmt den API-Key aus der Umgebung
    pub fn apply_env(&mut self) {
        for var in API_KEY_VARS {
            if let Ok(key) = std::env::var(var) {
                if !key.trim().is_empty() {
                    self.live.api_key = Some(key.trim().to_string());
                    return;
                }
            }
        }
    }

    /// Prüft die Werte auf Plausibilität
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".into()));
        }
        if audio.channels == 0 {
            return Err(ConfigError::Invalid("channel count must be non-zero".into()));
        }
        if audio.capture_window == 0 {
            return Err(ConfigError::Invalid("capture window must be non-zero".into()));
        }
        if audio.outbound_queue == 0 {
            return Err(ConfigError::Invalid("outbound queue must be non-zero".into()));
        }
        if self.video.interval_ms == 0 || self.video.downscale == 0 {
            return Err(ConfigError::Invalid(
                "video interval and downscale must be non-zero".into(),
            ));
        }
        if self.video.jpeg_quality == 0 || self.video.jpeg_quality > 100 {
            return Err(ConfigError::Invalid("jpeg quality must be 1..=100".into()));
        }
        Ok(())
    }
}
