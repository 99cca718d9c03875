//! # Capture Pipeline
//!
//! Turns a live microphone stream into wire frames pushed at a fixed cadence.
//!
//! ## Flow:
//! 1. The microphone stream yields blocks of samples of any size
//! 2. [`FrameAccumulator`] cuts them into `frame_size` windows
//! 3. Each window is encoded with the PCM codec
//! 4. The encoded frame is handed to a [`FrameSink`], exactly once, in capture order
//!
//! The pipeline runs on its own task. Handing a frame to the sink must not
//! block; a sink that cannot take a frame reports a [`SendError`], which is
//! logged and does not stop the frames after it. If the microphone stream
//! fails or ends, the sink is told through [`FrameSink::fault`] and the
//! pipeline stops.

use crate::audio::buffer::FrameAccumulator;
use crate::audio::codec::{self, WireFrame};
use crate::audio::device::SampleBlock;
use crate::error::{DeviceError, SendError};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver of encoded capture frames.
pub trait FrameSink: Send + Sync + 'static {
    /// Take one frame without waiting for it to be transmitted.
    fn deliver(&self, frame: WireFrame) -> Result<(), SendError>;

    /// The microphone stream failed; no more frames will follow.
    fn fault(&self, error: DeviceError);
}

/// Handle to a running capture task.
#[derive(Debug)]
pub struct CapturePipeline {
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start windowing `samples` into frames of `frame_size` samples.
    ///
    /// Must be called from within a tokio runtime. Returns immediately.
    pub fn start<S: FrameSink>(
        samples: BoxStream<'static, SampleBlock>,
        sample_rate: u32,
        frame_size: usize,
        sink: S,
    ) -> Self {
        let task = tokio::spawn(run_capture(samples, sample_rate, frame_size, sink));
        debug!(sample_rate, frame_size, "Capture pipeline started");
        Self { task: Some(task) }
    }

    /// Disconnect the windowing task. Calling it again does nothing.
    ///
    /// The microphone track itself is stopped by the session's teardown.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Capture pipeline stopped");
        }
    }

    /// Whether the windowing task is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_capture<S: FrameSink>(
    mut samples: BoxStream<'static, SampleBlock>,
    sample_rate: u32,
    frame_size: usize,
    sink: S,
) {
    let mut accumulator = FrameAccumulator::new(frame_size);
    let mut frame_count: u64 = 0;

    while let Some(block) = samples.next().await {
        let block = match block {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "Microphone stream failed");
                sink.fault(e);
                return;
            }
        };

        for window in accumulator.push(&block) {
            let frame = match codec::encode(&window, sample_rate) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode capture frame");
                    continue;
                }
            };

            frame_count += 1;
            if frame_count == 1 || frame_count % 50 == 0 {
                debug!(frame = frame_count, bytes = frame.data.len(), "Captured frame");
            }

            if let Err(e) = sink.deliver(frame) {
                warn!(frame = frame_count, error = %e, "Dropped capture frame");
            }
        }
    }

    warn!(frames = frame_count, "Microphone stream ended");
    sink.fault(DeviceError::Unavailable("microphone stream ended".to_string()));
}
