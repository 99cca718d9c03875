//! # Live Voice Client
//!
//! Streams live microphone audio to a remote conversational model and plays
//! the model's spoken replies back without gaps.
//!
//! ## Module Layout:
//! - **audio**: PCM codec, capture pipeline, playback scheduler, device traits and software devices
//! - **transport**: connection abstraction and the live WebSocket client
//! - **session**: the session state machine and its resource manager
//! - **config**: application configuration (TOML + environment variables)
//! - **error**: error taxonomy

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{SessionError, SessionResult};
pub use session::{Session, SessionCallbacks, SessionConfig, SessionState, SessionStats};
