//! # Voice Session
//!
//! The realtime session engine: one network connection, one capture pipeline
//! and one playback scheduler, driven through a small state machine.
//!
//! ## States:
//! ```text
//! Idle ──connect()──▶ Connecting ──handshake──▶ Open ──close / disconnect()──▶ Closed
//!                         │                      │
//!                         └──────── failure ─────┴──────────────────────────▶ Errored
//! ```
//! `Closed` and `Errored` are terminal. A session is used once; construct a new
//! one to reconnect.
//!
//! ## Key Components:
//! - **Session**: cloneable handle used by the caller (`connect`, `disconnect`, `state`)
//! - **Driver**: the task that owns the connection, the scheduler and the resources
//! - **SessionResources**: everything released on every exit path
//! - **SessionStats**: traffic counters
//!
//! All mutation of the playback timeline and of the lifecycle state happens
//! on the driver task, one event at a time.

mod driver;
pub mod lifecycle;
mod stats;

pub use stats::SessionStats;

use crate::audio::codec::AudioFrame;
use crate::audio::device::AudioDevices;
use crate::error::SessionError;
use crate::transport::Connector;
use driver::{Command, Driver};
use parking_lot::Mutex;
use stats::SessionCounters;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, Instrument};
use uuid::Uuid;

/// Immutable per-session configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// API key authorizing the connection; checked before anything is acquired
    pub credential: Option<String>,

    /// Instruction text sent once when the session opens
    pub persona: String,

    /// Prebuilt reply voice
    pub voice: String,

    pub model: String,

    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub channels: u16,

    /// Samples per captured frame
    pub frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential: None,
            persona: String::new(),
            voice: "Puck".to_string(),
            model: "gemini-2.0-flash-live-001".to_string(),
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            channels: 1,
            frame_size: crate::audio::buffer::DEFAULT_FRAME_SIZE,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("persona_len", &self.persona.len())
            .field("voice", &self.voice)
            .field("model", &self.model)
            .field("capture_sample_rate", &self.capture_sample_rate)
            .field("playback_sample_rate", &self.playback_sample_rate)
            .field("channels", &self.channels)
            .field("frame_size", &self.frame_size)
            .finish()
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl SessionState {
    /// No transition ever leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    fn is_settled(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Connecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

type AudioObserver = Arc<dyn Fn(&AudioFrame) + Send + Sync>;
type ErrorObserver = Box<dyn FnOnce(SessionError) + Send>;
type CloseObserver = Box<dyn FnOnce() + Send>;

/// Observers supplied by the caller.
///
/// `on_error` and `on_close` are consumed when they fire, so each runs at most
/// once, and only one of them runs per session.
#[derive(Default)]
pub struct SessionCallbacks {
    on_audio_data: Option<AudioObserver>,
    on_error: Option<ErrorObserver>,
    on_close: Option<CloseObserver>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per decoded, non-empty reply frame, before it is scheduled.
    pub fn on_audio_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&AudioFrame) + Send + Sync + 'static,
    {
        self.on_audio_data = Some(Arc::new(f));
        self
    }

    /// Called when the session ends in `Errored`.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(SessionError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called when the session ends in `Closed`.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(f));
        self
    }

    fn audio(&self, frame: &AudioFrame) {
        if let Some(observer) = &self.on_audio_data {
            observer(frame);
        }
    }

    fn error(&mut self, error: SessionError) {
        self.on_close = None;
        if let Some(observer) = self.on_error.take() {
            observer(error);
        }
    }

    fn close(&mut self) {
        self.on_error = None;
        if let Some(observer) = self.on_close.take() {
            observer();
        }
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_audio_data", &self.on_audio_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// What the driver needs, handed over on the first `connect()`.
struct Pending {
    devices: Arc<dyn AudioDevices>,
    connector: Arc<dyn Connector>,
    callbacks: SessionCallbacks,
    commands: mpsc::Receiver<Command>,
}

struct Inner {
    id: Uuid,
    config: Arc<SessionConfig>,
    state: Arc<watch::Sender<SessionState>>,
    commands: mpsc::Sender<Command>,
    pending: Mutex<Option<Pending>>,
    counters: Arc<SessionCounters>,
}

/// Handle to one voice session.
///
/// Clones share the same session. Dropping every handle of a running session
/// disconnects it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create an `Idle` session. Nothing is acquired until [`Session::connect`].
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn AudioDevices>,
        connector: Arc<dyn Connector>,
        callbacks: SessionCallbacks,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let id = Uuid::new_v4();
        debug!(session_id = %id, ?config, "Session created");

        Self {
            inner: Arc::new(Inner {
                id,
                config: Arc::new(config),
                state: Arc::new(state),
                commands: commands_tx,
                pending: Mutex::new(Some(Pending {
                    devices,
                    connector,
                    callbacks,
                    commands: commands_rx,
                })),
                counters: Arc::new(SessionCounters::default()),
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Open the session.
    ///
    /// Acquires the device contexts and the microphone, opens the connection
    /// and waits for the handshake. Failures are reported through `on_error`,
    /// never returned.
    ///
    /// ## Returns:
    /// The state the session settled in: `Open`, `Errored`, or `Closed` when
    /// `disconnect()` abandoned the attempt. Calling it on a session that
    /// already left `Idle` starts nothing and just waits for that outcome.
    pub async fn connect(&self) -> SessionState {
        let mut state_rx = self.inner.state.subscribe();

        let pending = {
            let mut guard = self.inner.pending.lock();
            let pending = guard.take();
            if pending.is_some() {
                self.inner.state.send_replace(SessionState::Connecting);
            }
            pending
        };

        match pending {
            Some(pending) => {
                info!(session_id = %self.inner.id, "Session connecting");
                let driver = Driver::new(
                    self.inner.config.clone(),
                    self.inner.state.clone(),
                    self.inner.counters.clone(),
                    pending.callbacks,
                );
                let span = tracing::info_span!("session", session_id = %self.inner.id);
                tokio::spawn(
                    driver
                        .run(pending.devices, pending.connector, pending.commands)
                        .instrument(span),
                );
            }
            None => debug!(session_id = %self.inner.id, state = %self.state(), "Session already started"),
        }

        let state = match state_rx.wait_for(|s| s.is_settled()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// End the session and release everything it holds.
    ///
    /// Idempotent: calling it again, or on a session that already ended, does
    /// nothing. Returns once the session is `Closed` or `Errored`.
    pub async fn disconnect(&self) {
        let never_started = self.inner.pending.lock().take();
        if let Some(mut pending) = never_started {
            info!(session_id = %self.inner.id, "Session closed before connecting");
            self.inner.counters.mark_ended();
            pending.callbacks.close();
            self.inner.state.send_replace(SessionState::Closed);
            return;
        }

        if self.state().is_terminal() {
            debug!(session_id = %self.inner.id, "Disconnect on ended session ignored");
            return;
        }

        let mut state_rx = self.inner.state.subscribe();
        if self.inner.commands.send(Command::Disconnect).await.is_err() {
            debug!(session_id = %self.inner.id, "Session driver already gone");
        }
        let _ = state_rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Wait until the session ends and return the terminal state.
    pub async fn closed(&self) -> SessionState {
        let mut state_rx = self.inner.state.subscribe();
        let state = match state_rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
