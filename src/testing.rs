//! In-memory fakes of the device and transport traits, shared by unit tests.

use crate::audio::capture::FrameSink;
use crate::audio::codec::{AudioFrame, WireFrame};
use crate::audio::device::{
    AudioContext, AudioDevices, ChunkId, CompletionSender, ContextState, MediaTrack, Microphone,
    MicrophoneStream, OutputClock, PlaybackDevice, SampleBlock,
};
use crate::error::{DeviceError, SendError, SessionError, TransportError};
use crate::session::SessionCallbacks;
use crate::transport::{
    CloseConnection, Connector, InboundEvent, LiveConnection, OutboundMessage, ServerMessage,
    SetupParams,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ── Devices ──────────────────────────────────────────────────────

/// Context state shared by the fake contexts.
struct ContextControl {
    state: Mutex<ContextState>,
    resume_error: Mutex<Option<DeviceError>>,
    close_error: Mutex<Option<DeviceError>>,
    close_calls: AtomicUsize,
}

impl ContextControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::Running),
            resume_error: Mutex::new(None),
            close_error: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        }
    }

    fn resume(&self) -> Result<(), DeviceError> {
        if let Some(e) = self.resume_error.lock().clone() {
            return Err(e);
        }
        let mut state = self.state.lock();
        if *state == ContextState::Closed {
            return Err(DeviceError::Closed);
        }
        *state = ContextState::Running;
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ContextState::Closed;
        match self.close_error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Capture-side context with scriptable failures.
pub struct FakeContext {
    sample_rate: u32,
    control: ContextControl,
}

impl FakeContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            control: ContextControl::new(),
        }
    }

    pub fn suspend(&self) {
        *self.control.state.lock() = ContextState::Suspended;
    }

    pub fn fail_resume(&self, error: DeviceError) {
        *self.control.resume_error.lock() = Some(error);
    }

    pub fn fail_close(&self, error: DeviceError) {
        *self.control.close_error.lock() = Some(error);
    }

    pub fn close_calls(&self) -> usize {
        self.control.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioContext for FakeContext {
    fn state(&self) -> ContextState {
        *self.control.state.lock()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.control.resume()
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.control.close()
    }
}

/// Playback context with a hand-driven clock that records every chunk.
pub struct FakePlayback {
    sample_rate: u32,
    control: ContextControl,
    now: Mutex<Duration>,
    started: Mutex<Vec<(ChunkId, Duration)>>,
    stopped: Mutex<Vec<ChunkId>>,
    completions: Mutex<HashMap<ChunkId, CompletionSender>>,
    refuse: AtomicBool,
}

impl FakePlayback {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            control: ContextControl::new(),
            now: Mutex::new(Duration::ZERO),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            completions: Mutex::new(HashMap::new()),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn set_time(&self, now: Duration) {
        *self.now.lock() = now;
    }

    /// Chunks started so far as `(id, start_at)`.
    pub fn started(&self) -> Vec<(ChunkId, Duration)> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<ChunkId> {
        self.stopped.lock().clone()
    }

    pub fn refuse_chunks(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Report that chunk `id` played to the end.
    pub fn finish(&self, id: ChunkId) {
        if let Some(ended) = self.completions.lock().remove(&id) {
            let _ = ended.send(id);
        }
    }

    pub fn suspend(&self) {
        *self.control.state.lock() = ContextState::Suspended;
    }

    pub fn fail_resume(&self, error: DeviceError) {
        *self.control.resume_error.lock() = Some(error);
    }

    pub fn close_calls(&self) -> usize {
        self.control.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioContext for FakePlayback {
    fn state(&self) -> ContextState {
        *self.control.state.lock()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.control.resume()
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.completions.lock().clear();
        self.control.close()
    }
}

impl OutputClock for FakePlayback {
    fn current_time(&self) -> Duration {
        *self.now.lock()
    }
}

impl PlaybackDevice for FakePlayback {
    fn start_chunk(
        &self,
        id: ChunkId,
        _frame: &AudioFrame,
        start_at: Duration,
        ended: CompletionSender,
    ) -> Result<(), DeviceError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DeviceError::Other("chunk refused".into()));
        }
        self.started.lock().push((id, start_at));
        self.completions.lock().insert(id, ended);
        Ok(())
    }

    fn stop_chunk(&self, id: ChunkId) {
        self.completions.lock().remove(&id);
        self.stopped.lock().push(id);
    }
}

pub struct FakeTrack {
    stopped: AtomicBool,
}

impl Default for FakeTrack {
    fn default() -> Self {
        Self {
            stopped: AtomicBool::new(false),
        }
    }
}

impl MediaTrack for FakeTrack {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

/// Microphone fed by the test through [`FakeMicrophone::push`].
pub struct FakeMicrophone {
    pub track: Arc<FakeTrack>,
    blocks: mpsc::UnboundedSender<SampleBlock>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<SampleBlock>>>,
    requests: AtomicUsize,
    denied: AtomicBool,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        let (blocks, stream) = mpsc::unbounded_channel();
        Self {
            track: Arc::new(FakeTrack::default()),
            blocks,
            stream: Mutex::new(Some(stream)),
            requests: AtomicUsize::new(0),
            denied: AtomicBool::new(false),
        }
    }

    pub fn push(&self, samples: Vec<f32>) {
        let _ = self.blocks.send(Ok(samples));
    }

    pub fn fail(&self, error: DeviceError) {
        let _ = self.blocks.send(Err(error));
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn request_access(&self, sample_rate: u32) -> Result<MicrophoneStream, DeviceError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("denied by test".into()));
        }
        let stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| DeviceError::Unavailable("already granted".into()))?;
        Ok(MicrophoneStream {
            samples: UnboundedReceiverStream::new(stream).boxed(),
            track: self.track.clone(),
            sample_rate,
        })
    }
}

/// Device factory handing out one set of fakes.
pub struct FakeDevices {
    pub capture: Arc<FakeContext>,
    pub playback: Arc<FakePlayback>,
    pub microphone: Arc<FakeMicrophone>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self {
            capture: Arc::new(FakeContext::new(16000)),
            playback: Arc::new(FakePlayback::new(24000)),
            microphone: Arc::new(FakeMicrophone::new()),
        }
    }
}

impl AudioDevices for FakeDevices {
    fn capture_context(&self, _sample_rate: u32) -> Result<Arc<dyn AudioContext>, DeviceError> {
        Ok(self.capture.clone())
    }

    fn playback_context(&self, _sample_rate: u32) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        Ok(self.playback.clone())
    }

    fn microphone(&self) -> Arc<dyn Microphone> {
        self.microphone.clone()
    }
}

// ── Transport ────────────────────────────────────────────────────

/// Close capability that counts its calls.
#[derive(Clone, Default)]
pub struct FakeCloser {
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl FakeCloser {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloseConnection for FakeCloser {
    async fn close(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Socket("close failed".into()));
        }
        Ok(())
    }
}

/// The server end of one fake connection.
pub struct FakeServer {
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::Receiver<OutboundMessage>,
    pub closer: FakeCloser,
}

impl FakeServer {
    pub async fn open(&self) {
        let _ = self.inbound.send(InboundEvent::Opened).await;
    }

    pub async fn send(&self, message: ServerMessage) {
        let _ = self.inbound.send(InboundEvent::Message(message)).await;
    }

    pub async fn close(&self, reason: Option<String>) {
        let _ = self.inbound.send(InboundEvent::Closed { reason }).await;
    }

    pub async fn fail(&self, error: TransportError) {
        let _ = self.inbound.send(InboundEvent::Failed(error)).await;
    }

    /// Next message the session sent, or `None` once the session let go.
    pub async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }
}

/// Connector whose connections are driven by the test through [`FakeServer`].
pub struct FakeConnector {
    servers_tx: mpsc::UnboundedSender<FakeServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeServer>>,
    connects: AtomicUsize,
    last_setup: Mutex<Option<SetupParams>>,
    failure: Mutex<Option<TransportError>>,
    outbound_capacity: AtomicUsize,
    with_closer: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
            connects: AtomicUsize::new(0),
            last_setup: Mutex::new(None),
            failure: Mutex::new(None),
            outbound_capacity: AtomicUsize::new(64),
            with_closer: AtomicBool::new(true),
        }
    }

    pub async fn next_server(&self) -> FakeServer {
        self.servers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_setup(&self) -> Option<SetupParams> {
        self.last_setup.lock().clone()
    }

    pub fn fail_with(&self, error: TransportError) {
        *self.failure.lock() = Some(error);
    }

    pub fn set_outbound_capacity(&self, capacity: usize) {
        self.outbound_capacity.store(capacity, Ordering::SeqCst);
    }

    pub fn without_closer(&self) {
        self.with_closer.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _credential: &str,
        setup: &SetupParams,
    ) -> Result<LiveConnection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_setup.lock() = Some(setup.clone());
        if let Some(e) = self.failure.lock().clone() {
            return Err(e);
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity.load(Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let closer = FakeCloser::default();

        let _ = self.servers_tx.send(FakeServer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            closer: closer.clone(),
        });

        let closer: Option<Box<dyn CloseConnection>> = if self.with_closer.load(Ordering::SeqCst) {
            Some(Box::new(closer))
        } else {
            None
        };
        Ok(LiveConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
            closer,
        })
    }
}

// ── Observers ────────────────────────────────────────────────────

/// Frame sink that records what the capture pipeline hands it.
#[derive(Clone)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<WireFrame>>>,
    count: Arc<watch::Sender<usize>>,
    fault: Arc<watch::Sender<Option<DeviceError>>>,
    reject: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            frames: Arc::default(),
            count: Arc::new(watch::channel(0).0),
            fault: Arc::new(watch::channel(None).0),
            reject: Arc::default(),
            rejected: Arc::default(),
        }
    }
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<WireFrame> {
        self.frames.lock().clone()
    }

    /// Refuse the next `n` frames with [`SendError::QueueFull`].
    pub fn reject_next(&self, n: usize) {
        self.reject.store(n, Ordering::SeqCst);
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn fault_reported(&self) -> Option<DeviceError> {
        self.fault.borrow().clone()
    }

    pub async fn wait_for_frames(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    pub async fn wait_for_fault(&self) -> DeviceError {
        let mut rx = self.fault.subscribe();
        let fault = rx.wait_for(|fault| fault.is_some()).await.expect("sink dropped");
        fault.clone().expect("fault present")
    }
}

impl FrameSink for RecordingSink {
    fn deliver(&self, frame: WireFrame) -> Result<(), SendError> {
        let reject = self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if reject {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(SendError::QueueFull);
        }

        let mut frames = self.frames.lock();
        frames.push(frame);
        self.count.send_replace(frames.len());
        Ok(())
    }

    fn fault(&self, error: DeviceError) {
        self.fault.send_replace(Some(error));
    }
}

/// Records every session callback invocation.
#[derive(Clone, Default)]
pub struct CallbackLog {
    audio: Arc<Mutex<Vec<usize>>>,
    errors: Arc<Mutex<Vec<SessionError>>>,
    closes: Arc<AtomicUsize>,
}

impl CallbackLog {
    pub fn callbacks(&self) -> SessionCallbacks {
        let audio = self.audio.clone();
        let errors = self.errors.clone();
        let closes = self.closes.clone();
        SessionCallbacks::new()
            .on_audio_data(move |frame| audio.lock().push(frame.len()))
            .on_error(move |e| errors.lock().push(e))
            .on_close(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            })
    }

    /// Sample counts of the observed reply frames, in order.
    pub fn audio_lengths(&self) -> Vec<usize> {
        self.audio.lock().clone()
    }

    pub fn errors(&self) -> Vec<SessionError> {
        self.errors.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}
