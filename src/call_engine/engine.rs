//! Call Engine
//!
//! Verwaltet einen Anruf mit der Live-Session und koordiniert
//! Capture, Video Sampler und Wiedergabe.
//!
//! Jeder Anruf läuft als genau ein Task. Dieser Task besitzt die
//! `CallSession`, den Playback Scheduler und die Geräte; alle Events
//! (Server, Hang-up, Gerätefehler, Wiedergabe-Ende) werden dort nacheinander
//! in einem `select!` verarbeitet.

use super::audio::AudioError;
use super::capture::CapturePipeline;
use super::media::{CaptureRequest, MediaDevices, MediaError, MediaStreams, OutputRequest, SystemMedia};
use super::pcm::decode_payload;
use super::playback::{AudioOutput, PlaybackScheduler, UnitId};
use super::session::{CallFault, CallSession, CallState, MediaGate, MediaKind, RemoteParty};
use super::stats::{AudioLevels, CallStats, StatsSnapshot};
use super::task::TaskHandle;
use super::video::VideoSampler;
use crate::config::{CallConfig, ConfigError};
use crate::live::{GeminiLiveConnector, LiveConnector, LiveSession, SessionError, SessionEvent, SessionParams};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Kurzname für Host-Anwendungen
pub type CallError = CallEngineError;

impl CallEngineError {
    /// Text für die Benachrichtigung an den Nutzer
    pub fn user_message(&self) -> String {
        match self {
            CallEngineError::PermissionDenied(_) => "Camera/Mic permission denied".to_string(),
            CallEngineError::Transport(_) => "Call ended: connection lost".to_string(),
            CallEngineError::Device(_) | CallEngineError::Audio(_) => {
                "Call ended: audio/video device unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<MediaError> for CallEngineError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied(msg) => CallEngineError::PermissionDenied(msg),
            MediaError::Audio(e) => CallEngineError::Audio(e),
            MediaError::Camera(msg) => CallEngineError::Device(msg),
        }
    }
}

impl From<SessionError> for CallEngineError {
    fn from(e: SessionError) -> Self {
        CallEngineError::Transport(e.to_string())
    }
}

impl From<CallFault> for CallEngineError {
    fn from(fault: CallFault) -> Self {
        match fault {
            CallFault::Transport(msg) => CallEngineError::Transport(msg),
            CallFault::DeviceLost(msg) => CallEngineError::Device(msg),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        call_id: Uuid,
        state: CallState,
    },
    /// Für den Nutzer bestimmte Meldung (Toast)
    Notification {
        call_id: Uuid,
        message: String,
        error: CallEngineError,
    },
}

/// Überträgt Zustandswechsel des Call-Tasks an die Engine
#[derive(Clone)]
struct StateReporter {
    call_id: Uuid,
    shared: Arc<Mutex<CallState>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl StateReporter {
    fn transition(
        &self,
        session: &mut CallSession,
        next: CallState,
    ) -> Result<(), CallEngineError> {
        session.transition(next)?;
        *self.shared.lock() = next;
        let _ = self.event_tx.send(CallEvent::StateChanged {
            call_id: self.call_id,
            state: next,
        });
        Ok(())
    }

    fn notify_error(&self, error: &CallEngineError) {
        let _ = self.event_tx.send(CallEvent::Notification {
            call_id: self.call_id,
            message: error.user_message(),
            error: error.clone(),
        });
    }

    /// Eine Meldung, dann Errored
    fn fail(&self, session: &mut CallSession, error: &CallEngineError) {
        tracing::error!(call_id = %self.call_id, "Call failed: {}", error);
        self.notify_error(error);
        if let Err(e) = self.transition(session, CallState::Errored) {
            tracing::error!("Failed to mark call as errored: {}", e);
        }
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Laufender Anruf aus Sicht der Engine
struct ActiveCall {
    id: Uuid,
    hangup: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct CallEngine {
    config: Arc<CallConfig>,
    connector: Arc<dyn LiveConnector>,
    devices: Arc<dyn MediaDevices>,
    state: Arc<Mutex<CallState>>,
    current: tokio::sync::Mutex<Option<ActiveCall>>,
    call_id: Mutex<Option<Uuid>>,
    gate: Mutex<Option<Arc<MediaGate>>>,
    stats: Mutex<Arc<CallStats>>,
    levels: Arc<AudioLevels>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(
        config: CallConfig,
        connector: Arc<dyn LiveConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config: Arc::new(config),
            connector,
            devices,
            state: Arc::new(Mutex::new(CallState::Idle)),
            current: tokio::sync::Mutex::new(None),
            call_id: Mutex::new(None),
            gate: Mutex::new(None),
            stats: Mutex::new(Arc::new(CallStats::default())),
            levels: Arc::new(AudioLevels::default()),
            event_tx,
        }
    }

    /// Engine mit Gemini Live und den Systemgeräten
    pub fn with_defaults(config: CallConfig) -> Result<Self, CallEngineError> {
        config
            .validate()
            .map_err(|e| CallEngineError::Config(e.to_string()))?;
        if config.live.api_key.is_none() {
            return Err(CallEngineError::Config(
                ConfigError::MissingApiKey.to_string(),
            ));
        }

        let connector = GeminiLiveConnector::new(&config.live, config.audio.outbound_queue);
        Ok(Self::new(
            config,
            Arc::new(connector),
            Arc::new(SystemMedia::new()),
        ))
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    ///
    /// `Closed`/`Errored` bleiben sichtbar bis zum nächsten Anruf.
    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// ID des aktuellen (oder zuletzt beendeten) Anrufs
    pub fn call_id(&self) -> Option<Uuid> {
        *self.call_id.lock()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Startet einen Anruf mit der Gegenstelle
    ///
    /// Fordert die Geräte an und öffnet die Ausgabe; der Verbindungsaufbau
    /// läuft danach im Call-Task. Ein vorheriger Anruf muss vollständig
    /// abgebaut sein.
    pub async fn start_call(
        &self,
        remote: RemoteParty,
        media_kind: MediaKind,
    ) -> Result<Uuid, CallEngineError> {
        let mut current = self.current.lock().await;

        // Prüfen ob bereits ein Anruf aktiv ist
        if let Some(call) = current.as_ref() {
            if !call.task.is_finished() {
                return Err(CallEngineError::AlreadyInCall);
            }
        }
        if let Some(previous) = current.take() {
            let _ = previous.task.await;
        }

        let mut session = CallSession::new(remote, media_kind, &self.config.audio);
        let call_id = session.id();
        let reporter = StateReporter {
            call_id,
            shared: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
        };

        let gate = Arc::new(MediaGate::new());
        let stats = Arc::new(CallStats::default());
        self.levels.reset();
        *self.call_id.lock() = Some(call_id);
        *self.gate.lock() = Some(Arc::clone(&gate));
        *self.stats.lock() = Arc::clone(&stats);

        tracing::info!(
            call_id = %call_id,
            "Starting {} call with {}",
            media_kind,
            session.remote().display_name
        );
        reporter.transition(&mut session, CallState::Connecting)?;

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        // Geräte anfordern
        let request = CaptureRequest {
            want_video: media_kind.wants_video(),
            sample_rate: session.input_sample_rate(),
            faults: faults_tx.clone(),
        };
        let media = match self.devices.acquire(request).await {
            Ok(media) => media,
            Err(e) => {
                let error = CallEngineError::from(e);
                reporter.fail(&mut session, &error);
                return Err(error);
            }
        };

        let output_request = OutputRequest {
            sample_rate: session.output_sample_rate(),
            channels: session.channels(),
            completions: completions_tx,
            faults: faults_tx.clone(),
            levels: Arc::clone(&self.levels),
        };
        let output = match self.devices.open_output(output_request) {
            Ok(output) => output,
            Err(e) => {
                drop(media);
                let error = CallEngineError::from(e);
                reporter.fail(&mut session, &error);
                return Err(error);
            }
        };

        let (hangup_tx, hangup_rx) = oneshot::channel();
        let task = CallTask {
            session,
            config: Arc::clone(&self.config),
            reporter,
            media,
            scheduler: PlaybackScheduler::new(output),
            transport: None,
            capture: None,
            video: None,
            gate,
            stats,
            levels: Arc::clone(&self.levels),
            faults_tx,
        };

        let handle = tokio::spawn(task.run(
            Arc::clone(&self.connector),
            hangup_rx,
            faults_rx,
            completions_rx,
        ));

        *current = Some(ActiveCall {
            id: call_id,
            hangup: Some(hangup_tx),
            task: handle,
        });

        Ok(call_id)
    }

    /// Beendet den aktuellen Anruf und wartet auf den vollständigen Abbau
    pub async fn hang_up(&self) -> Result<(), CallEngineError> {
        let mut current = self.current.lock().await;
        let call = current.as_mut().ok_or(CallEngineError::NoActiveCall)?;

        if call.task.is_finished() {
            return Err(CallEngineError::NoActiveCall);
        }

        tracing::info!(call_id = %call.id, "Hanging up");
        if let Some(hangup) = call.hangup.take() {
            let _ = hangup.send(());
        }
        if let Err(e) = (&mut call.task).await {
            tracing::error!("Call task failed: {}", e);
        }
        current.take();
        Ok(())
    }

    /// Setzt Mute-Status
    pub fn set_muted(&self, muted: bool) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.set_muted(muted);
        }
    }

    /// Gibt Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.gate
            .lock()
            .as_ref()
            .map(|g| g.is_muted())
            .unwrap_or(false)
    }

    /// Schaltet die Kamerabilder ab oder wieder an
    pub fn set_video_off(&self, off: bool) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.set_video_off(off);
        }
    }

    pub fn is_video_off(&self) -> bool {
        self.gate
            .lock()
            .as_ref()
            .map(|g| g.is_video_off())
            .unwrap_or(false)
    }

    /// Gibt Audio-Levels zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.levels.get()
    }

    /// Zähler des aktuellen (oder letzten) Anrufs
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.lock().snapshot()
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("call_id", &self.call_id())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// CALL TASK
// ============================================================================

/// Warum der Anruf endet
#[derive(Debug)]
enum Exit {
    HangUp,
    RemoteClosed,
    Failed(CallEngineError),
}

struct CallTask {
    session: CallSession,
    config: Arc<CallConfig>,
    reporter: StateReporter,
    media: MediaStreams,
    scheduler: PlaybackScheduler<Box<dyn AudioOutput>>,
    transport: Option<Arc<dyn LiveSession>>,
    capture: Option<TaskHandle>,
    video: Option<TaskHandle>,
    gate: Arc<MediaGate>,
    stats: Arc<CallStats>,
    levels: Arc<AudioLevels>,
    faults_tx: mpsc::UnboundedSender<CallFault>,
}

impl CallTask {
    async fn run(
        mut self,
        connector: Arc<dyn LiveConnector>,
        mut hangup: oneshot::Receiver<()>,
        mut faults: mpsc::UnboundedReceiver<CallFault>,
        mut completions: mpsc::UnboundedReceiver<UnitId>,
    ) {
        let params = SessionParams::for_call(
            &self.config.live,
            self.session.remote(),
            self.session.media_kind(),
        );

        // Verbindungsaufbau, abbrechbar durch Hang-up
        let connected = tokio::select! {
            biased;
            _ = &mut hangup => Err(Exit::HangUp),
            Some(fault) = faults.recv() => Err(Exit::Failed(fault.into())),
            result = connector.connect(params) => result.map_err(|e| Exit::Failed(e.into())),
        };

        let exit = match connected {
            Err(exit) => exit,
            Ok((transport, mut events)) => {
                self.transport = Some(transport);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut hangup => break Exit::HangUp,
                        Some(fault) = faults.recv() => break Exit::Failed(fault.into()),
                        event = events.recv() => {
                            let event = event.unwrap_or(SessionEvent::Closed { reason: None });
                            if let Some(exit) = self.handle_event(event) {
                                break exit;
                            }
                        }
                        Some(id) = completions.recv() => {
                            if self.scheduler.on_unit_ended(id) {
                                self.stats.buffer_completed();
                            }
                        }
                    }
                }
            }
        };

        self.teardown(exit).await;
    }

    /// Verarbeitet ein Server-Event; `Some` beendet den Anruf
    fn handle_event(&mut self, event: SessionEvent) -> Option<Exit> {
        let active = self.session.state() == CallState::Active;

        match event {
            SessionEvent::Ready => {
                if active {
                    tracing::debug!("Duplicate setup confirmation ignored");
                    return None;
                }
                if let Err(e) = self.reporter.transition(&mut self.session, CallState::Active) {
                    return Some(Exit::Failed(e));
                }
                self.start_media();
            }

            SessionEvent::Audio(payload) => {
                if !active {
                    tracing::debug!("Audio before setup confirmation ignored");
                    return None;
                }
                match decode_payload(
                    &payload,
                    self.session.output_sample_rate(),
                    self.session.channels(),
                ) {
                    Ok(buffer) => {
                        if self.scheduler.schedule(buffer).is_some() {
                            self.stats.buffer_scheduled();
                        }
                    }
                    Err(e) => {
                        self.stats.decode_error();
                        tracing::warn!("Dropping remote audio: {}", e);
                    }
                }
            }

            SessionEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                self.stats.interruption();
                tracing::info!("Remote interrupted, {} unit(s) stopped", stopped);
            }

            SessionEvent::TurnComplete => {
                tracing::debug!("Remote turn complete");
            }

            SessionEvent::Closed { reason } => {
                tracing::info!("Live session closed: {:?}", reason);
                if active {
                    return Some(Exit::RemoteClosed);
                }
                let reason = reason.unwrap_or_else(|| "closed before setup".to_string());
                return Some(Exit::Failed(CallEngineError::Transport(reason)));
            }

            SessionEvent::Error(msg) => {
                tracing::error!("Live session error: {}", msg);
                return Some(Exit::Failed(CallEngineError::Transport(msg)));
            }
        }

        None
    }

    /// Startet Capture Pipeline und Video Sampler als getrennte Tasks
    fn start_media(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        self.gate.set_active(true);

        if let Some(mut frames) = self.media.take_audio() {
            // Vor dem Setup aufgenommenes Audio wird nicht gesendet
            while frames.try_recv().is_ok() {}

            let pipeline = CapturePipeline::new(
                &self.config.audio,
                Arc::clone(&self.gate),
                Arc::clone(&self.levels),
                Arc::clone(&self.stats),
            );
            self.capture = Some(pipeline.spawn(
                frames,
                Arc::clone(&transport),
                self.faults_tx.clone(),
            ));
        }

        if self.session.media_kind().wants_video() {
            if let Some(source) = self.media.video() {
                let sampler = VideoSampler::new(
                    &self.config.video,
                    Arc::clone(&self.gate),
                    Arc::clone(&self.stats),
                );
                self.video = Some(sampler.spawn(source, transport, self.faults_tx.clone()));
            }
        }
    }

    /// Vollständiger Abbau, auf jedem Pfad identisch
    async fn teardown(mut self, exit: Exit) {
        let call_id = self.session.id();

        if matches!(exit, Exit::HangUp) && self.session.state().is_live() {
            if let Err(e) = self.reporter.transition(&mut self.session, CallState::Closing) {
                tracing::error!("Failed to mark call as closing: {}", e);
            }
        }

        self.gate.set_active(false);
        if let Some(capture) = self.capture.take() {
            capture.stop().await;
        }
        if let Some(video) = self.video.take() {
            video.stop().await;
        }
        self.scheduler.close();
        self.media.release();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.levels.reset();

        match exit {
            Exit::HangUp | Exit::RemoteClosed => {
                if let Err(e) = self.reporter.transition(&mut self.session, CallState::Closed) {
                    tracing::error!("Failed to mark call as closed: {}", e);
                }
            }
            Exit::Failed(error) => {
                self.reporter.fail(&mut self.session, &error);
            }
        }

        let duration = chrono::Utc::now() - self.session.created_at();
        tracing::info!(
            call_id = %call_id,
            "Call torn down after {} ms: {:?}",
            duration.num_milliseconds(),
            self.stats.snapshot()
        );
    }
}
