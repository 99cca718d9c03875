//! # Frame Accumulator
//!
//! Slices a continuous microphone sample stream into fixed-size windows.
//! Devices deliver samples in whatever block size suits them; the live
//! endpoint wants evenly sized frames, so samples are queued here until a
//! full window is available.
//!
//! ## Key Features:
//! - **Fixed windows**: every emitted frame has exactly `frame_size` samples
//! - **Capture order**: windows are emitted in the order samples arrived
//! - **No loss**: a partial window stays queued until the next block fills it

use std::collections::VecDeque;

/// Default window length in samples (256 ms at 16 kHz).
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Queue of captured samples that yields fixed-size windows.
///
/// Owned by the capture task alone, so no locking is needed.
#[derive(Debug)]
pub struct FrameAccumulator {
    /// Samples waiting to complete a window
    pending: VecDeque<f32>,

    /// Samples per emitted window
    frame_size: usize,
}

impl FrameAccumulator {
    /// Create an accumulator emitting windows of `frame_size` samples.
    ///
    /// A `frame_size` of zero is treated as one sample per window.
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            pending: VecDeque::with_capacity(frame_size * 2),
            frame_size,
        }
    }

    /// Queue a block of samples and return every window it completed.
    ///
    /// ## Example:
    /// With a window of 4 and 3 samples already queued, pushing 6 samples
    /// returns two windows and leaves one sample queued.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend(block.iter().copied());

        let mut windows = Vec::with_capacity(self.pending.len() / self.frame_size);
        while self.pending.len() >= self.frame_size {
            windows.push(self.pending.drain(..self.frame_size).collect());
        }
        windows
    }

    /// Number of samples waiting for a full window.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Drop any partial window.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
