//! Per-session traffic counters.
//!
//! Counters are bumped from the capture task and the session driver without
//! locking; [`SessionStats`] is a point-in-time copy for callers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames produced by the capture pipeline
    pub frames_captured: u64,
    /// Frames handed to the connection
    pub frames_sent: u64,
    /// Frames dropped because the connection could not take them
    pub frames_dropped: u64,
    /// Reply audio chunks received from the server
    pub chunks_received: u64,
    /// Reply chunks handed to the playback device
    pub chunks_scheduled: u64,
    /// Reply chunks that were empty or could not be decoded
    pub chunks_skipped: u64,
    /// Reply chunks that played to the end
    pub chunks_played: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunks_scheduled: AtomicU64,
    pub chunks_skipped: AtomicU64,
    pub chunks_played: AtomicU64,
    pub interruptions: AtomicU64,
    pub turns_completed: AtomicU64,
    opened_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
}

impl SessionCounters {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_opened(&self) {
        *self.opened_at.lock() = Some(Utc::now());
    }

    /// Record the end of the session. Only the first call counts.
    pub fn mark_ended(&self) {
        self.ended_at.lock().get_or_insert_with(Utc::now);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            opened_at: *self.opened_at.lock(),
            ended_at: *self.ended_at.lock(),
        }
    }
}
