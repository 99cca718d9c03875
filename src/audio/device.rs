//! # Audio Device Abstractions
//!
//! Traits the session uses to talk to audio hardware, so the engine does not
//! depend on any particular backend. The crate ships software backends in
//! [`crate::audio::software`]; tests use in-memory fakes.
//!
//! | Trait | Role |
//! |---|---|
//! | [`AudioContext`] | a device context that may start suspended and must be resumed, then closed |
//! | [`OutputClock`] | the playback device's monotonic time reference |
//! | [`PlaybackDevice`] | a playback context that plays chunks at scheduled clock times |
//! | [`Microphone`] | grants access to a live sample stream |
//! | [`MediaTrack`] | the microphone track that must be stopped on teardown |
//! | [`AudioDevices`] | factory handing a session its contexts and microphone |
//!
//! All traits are object safe and used as `Arc<dyn ...>`.

use crate::audio::codec::AudioFrame;
use crate::error::DeviceError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of one scheduled playback chunk, unique per scheduler.
pub type ChunkId = u64;

/// Channel a playback device uses to report that a chunk finished naturally.
pub type CompletionSender = mpsc::UnboundedSender<ChunkId>;

/// One block of microphone samples, or the reason the device stopped.
pub type SampleBlock = Result<Vec<f32>, DeviceError>;

/// Lifecycle state of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created but not yet allowed to run (platform autoplay policy)
    Suspended,
    /// Running; the clock advances
    Running,
    /// Closed; every resource is released
    Closed,
}

/// A device context: a capture or playback graph owned by one session.
#[async_trait]
pub trait AudioContext: Send + Sync {
    fn state(&self) -> ContextState;

    /// Sample rate the context runs at.
    fn sample_rate(&self) -> u32;

    /// Leave the suspended state. A no-op on a running context.
    async fn resume(&self) -> Result<(), DeviceError>;

    /// Release the context. Closing twice must be harmless.
    async fn close(&self) -> Result<(), DeviceError>;
}

/// Monotonic time reference of the output device.
pub trait OutputClock: Send + Sync {
    /// Position of the output clock, measured from context creation.
    fn current_time(&self) -> Duration;
}

/// A playback context that can play chunks at future clock positions.
pub trait PlaybackDevice: AudioContext + OutputClock {
    /// Start `frame` at `start_at` on the output clock.
    ///
    /// When the chunk finishes on its own the device sends `id` on `ended`.
    /// A stopped chunk must not report completion.
    fn start_chunk(
        &self,
        id: ChunkId,
        frame: &AudioFrame,
        start_at: Duration,
        ended: CompletionSender,
    ) -> Result<(), DeviceError>;

    /// Stop a chunk immediately, whether it is waiting or already playing.
    /// Unknown ids are ignored.
    fn stop_chunk(&self, id: ChunkId);
}

/// The live track behind a microphone stream.
pub trait MediaTrack: Send + Sync {
    /// Stop the track and give the microphone back to the platform.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// A granted microphone: continuous samples plus the track controlling them.
pub struct MicrophoneStream {
    /// Blocks of mono samples at `sample_rate`, in capture order
    pub samples: BoxStream<'static, SampleBlock>,

    /// Handle used to stop the device on teardown
    pub track: Arc<dyn MediaTrack>,

    pub sample_rate: u32,
}

impl std::fmt::Debug for MicrophoneStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneStream")
            .field("sample_rate", &self.sample_rate)
            .field("live", &self.track.is_live())
            .finish()
    }
}

/// Source of microphone access.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Ask for microphone access at `sample_rate`.
    ///
    /// ## Errors:
    /// - **PermissionDenied**: the user or platform refused access
    /// - **Unavailable**: no input device is present
    async fn request_access(&self, sample_rate: u32) -> Result<MicrophoneStream, DeviceError>;
}

/// Factory for the device resources a session acquires while connecting.
pub trait AudioDevices: Send + Sync {
    /// Create the capture-side context.
    fn capture_context(&self, sample_rate: u32) -> Result<Arc<dyn AudioContext>, DeviceError>;

    /// Create the playback context whose clock schedules reply audio.
    fn playback_context(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackDevice>, DeviceError>;

    fn microphone(&self) -> Arc<dyn Microphone>;
}
