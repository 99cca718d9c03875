//! # Playback Scheduler
//!
//! Schedules decoded reply chunks for gapless, in-order playback against the
//! output device's monotonic clock.
//!
//! ## Scheduling Rule:
//! `start_at = max(next_playback_time, clock_now)`, then
//! `next_playback_time = start_at + chunk.duration`. Each chunk starts exactly
//! where the previous one ends; a gap only appears when the clock has caught
//! up with everything queued (the network stalled).
//!
//! ## Interruption:
//! [`PlaybackScheduler::flush`] stops every pending chunk, including the one
//! currently audible, and pulls `next_playback_time` back to "now".
//!
//! In-flight chunks live in an arena keyed by a monotonically increasing
//! [`ChunkId`]; the device reports natural completion by id.

use crate::audio::codec::AudioFrame;
use crate::audio::device::{ChunkId, CompletionSender, PlaybackDevice};
use crate::error::DeviceError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// A chunk handed to the device, as the scheduler remembers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub id: ChunkId,

    /// Start position on the output clock
    pub start_at: Duration,

    pub duration: Duration,
}

impl ScheduledChunk {
    /// Clock position at which the chunk stops sounding.
    pub fn end_at(&self) -> Duration {
        self.start_at + self.duration
    }
}

/// Gapless scheduler for one session's reply audio.
///
/// Mutated only by the session driver, one call at a time.
pub struct PlaybackScheduler {
    device: Arc<dyn PlaybackDevice>,

    /// Where the next chunk starts unless the clock is already past it
    next_playback_time: Duration,

    /// Chunks scheduled or playing, by id
    pending: BTreeMap<ChunkId, ScheduledChunk>,

    next_id: ChunkId,

    /// Handed to the device with every chunk
    completions: CompletionSender,
}

impl PlaybackScheduler {
    /// Create a scheduler for `device`.
    ///
    /// ## Returns:
    /// The scheduler and the receiver on which the device reports finished
    /// chunks; feed those ids back through [`PlaybackScheduler::complete`].
    pub fn new(device: Arc<dyn PlaybackDevice>) -> (Self, mpsc::UnboundedReceiver<ChunkId>) {
        let (completions, completed_rx) = mpsc::unbounded_channel();
        let now = device.current_time();
        (
            Self {
                device,
                next_playback_time: now,
                pending: BTreeMap::new(),
                next_id: 0,
                completions,
            },
            completed_rx,
        )
    }

    /// Schedule `frame` right after the previously scheduled chunk.
    ///
    /// ## Returns:
    /// - **Ok(Some(chunk))**: the frame was handed to the device
    /// - **Ok(None)**: the frame was empty and nothing was scheduled
    /// - **Err(..)**: the device refused the chunk; the timeline is unchanged
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<Option<ScheduledChunk>, DeviceError> {
        if frame.is_empty() {
            return Ok(None);
        }

        let now = self.device.current_time();
        let start_at = self.next_playback_time.max(now);
        let duration = frame.duration();
        let id = self.next_id;

        self.device
            .start_chunk(id, frame, start_at, self.completions.clone())?;

        let chunk = ScheduledChunk {
            id,
            start_at,
            duration,
        };
        self.next_id += 1;
        self.next_playback_time = chunk.end_at();
        self.pending.insert(id, chunk);

        debug!(
            chunk = id,
            start_ms = start_at.as_millis() as u64,
            duration_ms = duration.as_millis() as u64,
            pending = self.pending.len(),
            "Scheduled reply chunk"
        );
        Ok(Some(chunk))
    }

    /// Stop everything scheduled or playing and restart the timeline at now.
    ///
    /// ## Returns:
    /// Number of chunks that were cancelled.
    pub fn flush(&mut self) -> usize {
        let cancelled = self.pending.len();
        for id in self.pending.keys() {
            self.device.stop_chunk(*id);
        }
        self.pending.clear();
        self.next_playback_time = self.device.current_time();

        debug!(cancelled, "Flushed playback queue");
        cancelled
    }

    /// Forget a chunk the device finished playing.
    ///
    /// Returns false for ids that were already flushed.
    pub fn complete(&mut self, id: ChunkId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn next_playback_time(&self) -> Duration {
        self.next_playback_time
    }

    /// Chunks currently scheduled or playing.
    pub fn pending(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.pending.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}
