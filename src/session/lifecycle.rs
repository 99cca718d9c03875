//! # Session Resources
//!
//! Everything a session acquires while connecting, kept in one place so that
//! every exit path (clean close, error, explicit disconnect, failed setup)
//! releases all of it.
//!
//! ## Release Rules:
//! - Each resource is released independently; one failure does not stop the rest
//! - Releasing is idempotent: a released slot is empty and is skipped next time
//! - A connection without a close capability is tolerated, not an error

use crate::audio::capture::CapturePipeline;
use crate::audio::device::{AudioContext, MediaTrack, PlaybackDevice};
use crate::transport::CloseConnection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a best-effort connection close may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Resources owned by one session. Slots fill up as setup progresses.
#[derive(Default)]
pub struct SessionResources {
    pub capture: Option<CapturePipeline>,
    pub track: Option<Arc<dyn MediaTrack>>,
    pub capture_context: Option<Arc<dyn AudioContext>>,
    pub playback_context: Option<Arc<dyn PlaybackDevice>>,
    pub closer: Option<Box<dyn CloseConnection>>,
}

/// Outcome of one [`SessionResources::release`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Resources that were released
    pub released: Vec<&'static str>,
    /// Resources whose release failed, with the cause
    pub failed: Vec<(&'static str, String)>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl SessionResources {
    /// Drop the connection's close capability without using it.
    ///
    /// Used when the server already ended the connection.
    pub fn forget_connection(&mut self) {
        self.closer = None;
    }

    /// Whether nothing is held any more.
    pub fn is_empty(&self) -> bool {
        self.capture.is_none()
            && self.track.is_none()
            && self.capture_context.is_none()
            && self.playback_context.is_none()
            && self.closer.is_none()
    }

    /// Release everything still held.
    pub async fn release(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            report.released.push("capture pipeline");
        }

        if let Some(track) = self.track.take() {
            track.stop();
            report.released.push("microphone track");
        }

        if let Some(context) = self.capture_context.take() {
            match context.close().await {
                Ok(()) => report.released.push("capture context"),
                Err(e) => {
                    warn!(error = %e, "Failed to close capture context");
                    report.failed.push(("capture context", e.to_string()));
                }
            }
        }

        if let Some(context) = self.playback_context.take() {
            match context.close().await {
                Ok(()) => report.released.push("playback context"),
                Err(e) => {
                    warn!(error = %e, "Failed to close playback context");
                    report.failed.push(("playback context", e.to_string()));
                }
            }
        }

        match self.closer.take() {
            Some(closer) => match tokio::time::timeout(CLOSE_TIMEOUT, closer.close()).await {
                Ok(Ok(())) => report.released.push("connection"),
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to close connection");
                    report.failed.push(("connection", e.to_string()));
                }
                Err(_) => {
                    warn!("Timed out closing connection");
                    report.failed.push(("connection", "close timed out".to_string()));
                }
            },
            None => debug!("No connection close capability, skipping"),
        }

        debug!(
            released = report.released.len(),
            failed = report.failed.len(),
            "Session resources released"
        );
        report
    }
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("capture", &self.capture.is_some())
            .field("track", &self.track.is_some())
            .field("capture_context", &self.capture_context.is_some())
            .field("playback_context", &self.playback_context.is_some())
            .field("closer", &self.closer.is_some())
            .finish()
    }
}
