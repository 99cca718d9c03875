//! Session driver task.
//!
//! One task per session. It acquires resources while `Connecting`, then
//! multiplexes caller commands, connection events, playback completions and
//! capture faults until the session ends, and finally releases everything.

use super::lifecycle::SessionResources;
use super::stats::SessionCounters;
use super::{SessionCallbacks, SessionConfig, SessionState};
use crate::audio::capture::{CapturePipeline, FrameSink};
use crate::audio::codec::{self, WireFrame};
use crate::audio::device::{AudioContext, AudioDevices, ContextState, MicrophoneStream, PlaybackDevice};
use crate::audio::playback::PlaybackScheduler;
use crate::error::{DeviceError, SendError, SessionError, SetupError, TransportError};
use crate::transport::{Connector, InboundEvent, OutboundMessage, ServerMessage, SetupParams};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Requests from session handles.
#[derive(Debug)]
pub(crate) enum Command {
    Disconnect,
}

/// How a session ended.
enum Ending {
    /// Caller disconnected, or every handle was dropped
    Local,
    /// The server closed the connection
    Remote(Option<String>),
    Failed(SessionError),
}

/// What a completed setup hands to the open session.
struct Established {
    microphone: MicrophoneStream,
    playback: Arc<dyn PlaybackDevice>,
    outbound: mpsc::Sender<OutboundMessage>,
    inbound: mpsc::Receiver<InboundEvent>,
}

enum Setup {
    Ready(Established),
    Abandoned,
    Failed(SetupError),
}

pub(crate) struct Driver {
    config: Arc<SessionConfig>,
    state: Arc<watch::Sender<SessionState>>,
    counters: Arc<SessionCounters>,
    callbacks: SessionCallbacks,
    resources: SessionResources,
}

impl Driver {
    pub fn new(
        config: Arc<SessionConfig>,
        state: Arc<watch::Sender<SessionState>>,
        counters: Arc<SessionCounters>,
        callbacks: SessionCallbacks,
    ) -> Self {
        Self {
            config,
            state,
            counters,
            callbacks,
            resources: SessionResources::default(),
        }
    }

    pub async fn run(
        mut self,
        devices: Arc<dyn AudioDevices>,
        connector: Arc<dyn Connector>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let setup = tokio::select! {
            // A disconnect wins over a setup step finishing at the same time
            biased;
            _ = commands.recv() => Setup::Abandoned,
            result = establish(&self.config, devices.as_ref(), connector.as_ref(), &mut self.resources) => {
                match result {
                    Ok(established) => Setup::Ready(established),
                    Err(e) => Setup::Failed(e),
                }
            }
        };

        let ending = match setup {
            Setup::Ready(established) => self.run_open(established, &mut commands).await,
            Setup::Abandoned => {
                info!("Connect abandoned by disconnect");
                Ending::Local
            }
            Setup::Failed(e) => {
                error!(error = %e, "Session setup failed");
                Ending::Failed(SessionError::Setup(e))
            }
        };

        self.finish(ending).await;
    }

    /// The steady state: route traffic until something ends the session.
    async fn run_open(
        &mut self,
        established: Established,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Ending {
        let Established {
            microphone,
            playback,
            outbound,
            mut inbound,
        } = established;

        self.state.send_replace(SessionState::Open);
        self.counters.mark_opened();
        info!("Session open");

        let (faults_tx, mut faults) = mpsc::unbounded_channel();
        let sink = ConnectionSink {
            outbound: outbound.clone(),
            faults: faults_tx,
            counters: self.counters.clone(),
        };
        self.resources.capture = Some(CapturePipeline::start(
            microphone.samples,
            self.config.capture_sample_rate,
            self.config.frame_size,
            sink,
        ));

        let (mut scheduler, mut completed) = PlaybackScheduler::new(playback);

        let ending = loop {
            tokio::select! {
                _ = commands.recv() => {
                    // Tell the server no more input is coming; best effort
                    if outbound.try_send(OutboundMessage::AudioStreamEnd).is_err() {
                        debug!("Could not queue end of audio stream");
                    }
                    break Ending::Local;
                }
                event = inbound.recv() => match event {
                    Some(InboundEvent::Message(message)) => self.route(&mut scheduler, message),
                    Some(InboundEvent::Opened) => debug!("Duplicate handshake completion ignored"),
                    Some(InboundEvent::Closed { reason }) => break Ending::Remote(reason),
                    Some(InboundEvent::Failed(e)) => break Ending::Failed(SessionError::Transport(e)),
                    None => break Ending::Remote(None),
                },
                Some(id) = completed.recv() => {
                    if scheduler.complete(id) {
                        SessionCounters::bump(&self.counters.chunks_played);
                    }
                }
                Some(fault) = faults.recv() => {
                    break Ending::Failed(SessionError::Capture(fault));
                }
            }
        };

        let cancelled = scheduler.flush();
        if cancelled > 0 {
            debug!(cancelled, "Stopped reply audio on teardown");
        }
        ending
    }

    /// Handle one server message.
    ///
    /// An interruption is applied before any audio in the same message, so
    /// that audio belongs to the new reply.
    fn route(&mut self, scheduler: &mut PlaybackScheduler, message: ServerMessage) {
        if message.interrupted {
            SessionCounters::bump(&self.counters.interruptions);
            let cancelled = scheduler.flush();
            info!(cancelled, "Reply interrupted");
        }

        for chunk in &message.audio {
            let received = SessionCounters::bump(&self.counters.chunks_received);

            let samples = match codec::decode(chunk) {
                Ok(samples) if samples.is_empty() => {
                    SessionCounters::bump(&self.counters.chunks_skipped);
                    continue;
                }
                Ok(samples) => samples,
                Err(e) => {
                    SessionCounters::bump(&self.counters.chunks_skipped);
                    warn!(chunk = received, error = %e, "Skipping undecodable reply chunk");
                    continue;
                }
            };

            let frame = codec::build_playable_buffer(
                samples,
                self.config.playback_sample_rate,
                self.config.channels,
            );
            self.callbacks.audio(&frame);

            match scheduler.enqueue(&frame) {
                Ok(Some(_)) => {
                    SessionCounters::bump(&self.counters.chunks_scheduled);
                }
                Ok(None) => {}
                Err(e) => {
                    SessionCounters::bump(&self.counters.chunks_skipped);
                    warn!(chunk = received, error = %e, "Playback device refused reply chunk");
                }
            }

            if received == 1 || received % 50 == 0 {
                debug!(chunk = received, samples = frame.len(), "Reply audio received");
            }
        }

        if message.turn_complete {
            let turns = SessionCounters::bump(&self.counters.turns_completed);
            let audible_until_ms = scheduler
                .pending()
                .map(|chunk| chunk.end_at().as_millis() as u64)
                .max();
            debug!(
                turns,
                pending = scheduler.pending_len(),
                audible_until_ms = ?audible_until_ms,
                "Reply turn complete"
            );
        }
    }

    /// Release everything, notify the caller once, then settle the state.
    ///
    /// Anyone waiting on the state therefore sees the callback's effects.
    async fn finish(mut self, ending: Ending) {
        // An in-band server error leaves the socket open, so only a remote
        // close or a dead socket skips the close request
        if matches!(
            ending,
            Ending::Remote(_) | Ending::Failed(SessionError::Transport(TransportError::Socket(_)))
        ) {
            self.resources.forget_connection();
        }

        let report = self.resources.release().await;
        if !report.is_clean() {
            warn!(failed = ?report.failed, "Some session resources failed to release");
        }
        self.counters.mark_ended();

        let stats = self.counters.snapshot();
        match ending {
            Ending::Local => {
                info!(frames_sent = stats.frames_sent, chunks = stats.chunks_scheduled, "Session closed");
                self.callbacks.close();
                self.state.send_replace(SessionState::Closed);
            }
            Ending::Remote(reason) => {
                info!(reason = ?reason, frames_sent = stats.frames_sent, chunks = stats.chunks_scheduled, "Session closed by server");
                self.callbacks.close();
                self.state.send_replace(SessionState::Closed);
            }
            Ending::Failed(e) => {
                error!(error = %e, "Session errored");
                self.callbacks.error(e);
                self.state.send_replace(SessionState::Errored);
            }
        }
    }
}

/// Acquire devices, microphone and connection, then wait for the handshake.
///
/// Every acquired resource is stored in `resources` as soon as it exists, so
/// the caller releases it whether this returns, fails or is cancelled.
async fn establish(
    config: &SessionConfig,
    devices: &dyn AudioDevices,
    connector: &dyn Connector,
    resources: &mut SessionResources,
) -> Result<Established, SetupError> {
    let credential = config
        .credential
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or(SetupError::MissingCredential)?;

    let capture = devices
        .capture_context(config.capture_sample_rate)
        .map_err(|source| SetupError::ContextUnavailable {
            context: "capture",
            source,
        })?;
    resources.capture_context = Some(capture.clone());

    let playback = devices
        .playback_context(config.playback_sample_rate)
        .map_err(|source| SetupError::ContextUnavailable {
            context: "playback",
            source,
        })?;
    resources.playback_context = Some(playback.clone());

    check_rate(capture.as_ref(), "capture", config.capture_sample_rate);
    check_rate(playback.as_ref(), "playback", config.playback_sample_rate);

    resume_if_suspended(capture.as_ref(), "capture").await?;
    resume_if_suspended(playback.as_ref(), "playback").await?;

    let microphone = devices
        .microphone()
        .request_access(config.capture_sample_rate)
        .await
        .map_err(SetupError::Microphone)?;
    resources.track = Some(microphone.track.clone());
    debug!(sample_rate = microphone.sample_rate, "Microphone access granted");

    let setup = SetupParams {
        model: config.model.clone(),
        voice: config.voice.clone(),
        persona: config.persona.clone(),
    };
    let mut connection = connector
        .connect(credential, &setup)
        .await
        .map_err(|e| SetupError::Handshake(e.to_string()))?;
    resources.closer = connection.closer.take();

    loop {
        match connection.inbound.recv().await {
            Some(InboundEvent::Opened) => break,
            Some(InboundEvent::Message(_)) => debug!("Server message before handshake ignored"),
            Some(InboundEvent::Closed { reason }) => {
                let detail = reason.unwrap_or_else(|| TransportError::ClosedBeforeOpen.to_string());
                return Err(SetupError::Handshake(detail));
            }
            Some(InboundEvent::Failed(e)) => return Err(SetupError::Handshake(e.to_string())),
            None => {
                return Err(SetupError::Handshake(
                    TransportError::ClosedBeforeOpen.to_string(),
                ))
            }
        }
    }

    Ok(Established {
        microphone,
        playback,
        outbound: connection.outbound,
        inbound: connection.inbound,
    })
}

/// Frames are built at the configured rate; a context running at another
/// rate resamples them.
fn check_rate<C: AudioContext + ?Sized>(context: &C, name: &'static str, configured: u32) {
    let actual = context.sample_rate();
    if actual != configured {
        warn!(context = name, configured, actual, "Audio context runs at a different sample rate");
    }
}

async fn resume_if_suspended<C: AudioContext + ?Sized>(
    context: &C,
    name: &'static str,
) -> Result<(), SetupError> {
    if context.state() != ContextState::Suspended {
        return Ok(());
    }
    debug!(context = name, "Resuming suspended audio context");
    context
        .resume()
        .await
        .map_err(|source| SetupError::ContextResume {
            context: name,
            source,
        })
}

/// Capture frames go straight into the connection's outbound queue.
struct ConnectionSink {
    outbound: mpsc::Sender<OutboundMessage>,
    faults: mpsc::UnboundedSender<DeviceError>,
    counters: Arc<SessionCounters>,
}

impl FrameSink for ConnectionSink {
    fn deliver(&self, frame: WireFrame) -> Result<(), SendError> {
        SessionCounters::bump(&self.counters.frames_captured);

        let result = match self.outbound.try_send(OutboundMessage::Audio(frame)) {
            Ok(()) => {
                SessionCounters::bump(&self.counters.frames_sent);
                return Ok(());
            }
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SendError::NotSendable),
        };
        SessionCounters::bump(&self.counters.frames_dropped);
        result
    }

    fn fault(&self, error: DeviceError) {
        // The driver is gone once the session has ended
        let _ = self.faults.send(error);
    }
}
