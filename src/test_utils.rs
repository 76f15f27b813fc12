//! Test-Doubles für Geräte, Ausgabe-Uhr und Live-Session

use crate::call_engine::media::{
    CaptureRequest, FrameSource, MediaDevices, MediaError, MediaStreams, OutputRequest, RawFrame,
};
use crate::call_engine::pcm::AudioBuffer;
use crate::call_engine::playback::{AudioOutput, UnitId};
use crate::live::{
    LiveConnector, LiveSession, MediaChunk, SessionError, SessionEvent, SessionParams,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// MANUAL OUTPUT
// ============================================================================

/// Von Hand gestellte Ausgabe-Uhr
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<Mutex<Duration>>);

impl ManualClock {
    pub fn set(&self, now: Duration) {
        *self.0.lock() = now;
    }

    pub fn get(&self) -> Duration {
        *self.0.lock()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedUnit {
    pub id: UnitId,
    pub at: Duration,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct OutputLog {
    pub started: Vec<StartedUnit>,
    pub stopped: Vec<UnitId>,
    pub closed: bool,
}

/// Ausgabe ohne Gerät, protokolliert alle Aufrufe
#[derive(Debug, Clone, Default)]
pub struct ManualOutput {
    clock: ManualClock,
    log: Arc<Mutex<OutputLog>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn log(&self) -> Arc<Mutex<OutputLog>> {
        Arc::clone(&self.log)
    }
}

impl AudioOutput for ManualOutput {
    fn now(&self) -> Duration {
        self.clock.get()
    }

    fn start(&mut self, id: UnitId, buffer: AudioBuffer, at: Duration) {
        self.log.lock().started.push(StartedUnit {
            id,
            at,
            duration: buffer.duration(),
        });
    }

    fn stop(&mut self, id: UnitId) {
        self.log.lock().stopped.push(id);
    }

    fn close(&mut self) {
        self.log.lock().closed = true;
    }
}

// ============================================================================
// SCRIPTED DEVICES
// ============================================================================

/// Letztes Kamerabild, von Tests gesetzt
#[derive(Debug, Default)]
pub struct StaticFrameSource {
    frame: Mutex<Option<RawFrame>>,
}

impl StaticFrameSource {
    pub fn set(&self, frame: Option<RawFrame>) {
        *self.frame.lock() = frame;
    }
}

impl FrameSource for StaticFrameSource {
    fn latest_frame(&self) -> Option<RawFrame> {
        self.frame.lock().clone()
    }
}

/// Setzt beim Drop ein Flag, steht für freigegebene Geräte
struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Geräte-Attrappe: rohe Audio-Frames und Kamerabilder kommen vom Test
#[derive(Default)]
pub struct ScriptedDevices {
    pub deny: AtomicBool,
    pub acquisitions: AtomicUsize,
    pub released: Arc<AtomicBool>,
    pub frames: Arc<StaticFrameSource>,
    pub output: ManualOutput,
    raw_audio: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    completions: Mutex<Option<mpsc::UnboundedSender<UnitId>>>,
}

impl ScriptedDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sender für rohe Mikrofon-Frames des aktuellen Anrufs
    pub fn raw_audio(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        self.raw_audio.lock().clone()
    }

    /// Meldet eine Einheit als fertig abgespielt
    pub fn complete(&self, id: UnitId) {
        if let Some(tx) = self.completions.lock().as_ref() {
            let _ = tx.send(id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn acquire(&self, request: CaptureRequest) -> Result<MediaStreams, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("denied by test".into()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        *self.raw_audio.lock() = Some(tx);

        let video = request
            .want_video
            .then(|| Arc::clone(&self.frames) as Arc<dyn FrameSource>);

        Ok(MediaStreams::new(
            rx,
            video,
            ReleaseFlag(Arc::clone(&self.released)),
        ))
    }

    fn open_output(&self, request: OutputRequest) -> Result<Box<dyn AudioOutput>, MediaError> {
        *self.completions.lock() = Some(request.completions);
        Ok(Box::new(self.output.clone()))
    }
}

// ============================================================================
// SCRIPTED LIVE SESSION
// ============================================================================

/// Live-Session-Attrappe, zeichnet gesendete Chunks auf
#[derive(Default)]
pub struct MockSession {
    pub sent: Mutex<Vec<MediaChunk>>,
    pub closed: AtomicBool,
    /// Maximale Anzahl angenommener Chunks (None = unbegrenzt)
    pub capacity: Mutex<Option<usize>>,
}

impl MockSession {
    pub fn sent_with_mime(&self, prefix: &str) -> Vec<MediaChunk> {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.mime_type.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LiveSession for MockSession {
    fn send_media(&self, chunk: MediaChunk) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let mut sent = self.sent.lock();
        if let Some(cap) = *self.capacity.lock() {
            if sent.len() >= cap {
                return Err(SessionError::QueueFull);
            }
        }
        sent.push(chunk);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Verhalten von `ScriptedConnector::connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    #[default]
    Succeed,
    Fail,
    /// Verbindung hängt, bis der Anruf abgebrochen wird
    Hang,
}

/// Connector-Attrappe: der Test schiebt Server-Events selbst ein
#[derive(Default)]
pub struct ScriptedConnector {
    pub mode: Mutex<ConnectMode>,
    pub session: Arc<MockSession>,
    pub params: Mutex<Option<SessionParams>>,
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_mode(mode: ConnectMode) -> Arc<Self> {
        let connector = Self::default();
        *connector.mode.lock() = mode;
        Arc::new(connector)
    }

    /// Schiebt ein Server-Event in den aktuellen Anruf
    pub async fn push(&self, event: SessionEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Ein Anruf hält den Event-Strom offen
    pub fn is_connected(&self) -> bool {
        self.events
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(
        &self,
        params: SessionParams,
    ) -> Result<(Arc<dyn LiveSession>, mpsc::Receiver<SessionEvent>), SessionError> {
        *self.params.lock() = Some(params);
        let mode = *self.mode.lock();
        match mode {
            ConnectMode::Fail => Err(SessionError::ConnectionFailed("refused by test".into())),
            ConnectMode::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            ConnectMode::Succeed => {
                let (tx, rx) = mpsc::channel(64);
                *self.events.lock() = Some(tx);
                self.session.closed.store(false, Ordering::SeqCst);
                Ok((Arc::clone(&self.session) as Arc<dyn LiveSession>, rx))
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Wartet (real) bis die Bedingung erfüllt ist, max. 2 Sekunden
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
