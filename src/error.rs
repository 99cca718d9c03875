//! # Error Handling
//!
//! Error types for the realtime voice session. Only two kinds ever reach the
//! caller (through the `on_error` callback); everything else is absorbed where
//! it happens so the audio pipelines keep running.
//!
//! ## Error Categories:
//! - **SetupError**: failures while `Connecting` (credential, device context,
//!   microphone, handshake). Terminal for that connect attempt.
//! - **TransportError**: network failure after the handshake. Terminal for the session.
//! - **DecodeError**: one malformed reply chunk. Skipped, never reported.
//! - **SendError**: one outbound frame failed to transmit. Logged and dropped.
//! - **DeviceError**: raw failure from an audio device backend. Wrapped into one
//!   of the above depending on when it happens.

use thiserror::Error;

/// Failure reported by an audio device backend (context, microphone, output).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device context could not leave the suspended state
    #[error("device context could not be resumed: {0}")]
    ResumeFailed(String),

    /// Microphone access was refused (permission denied, no device)
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    /// The device went away mid-session (unplugged, revoked)
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    /// The context was already closed when it was used
    #[error("audio context is closed")]
    Closed,

    /// Any other backend failure (I/O, file format, ...)
    #[error("audio device error: {0}")]
    Other(String),
}

/// Failures that can only happen while the session is `Connecting`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("missing credential: an API key is required to open a session")]
    MissingCredential,

    #[error("could not create {context} audio context: {source}")]
    ContextUnavailable {
        context: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("failed to resume {context} audio context: {source}")]
    ContextResume {
        context: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("microphone unavailable: {0}")]
    Microphone(#[source] DeviceError),

    #[error("connection handshake failed: {0}")]
    Handshake(String),
}

/// Network-level failure once the connection exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("could not reach the live endpoint: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    Socket(String),

    #[error("server reported an error: {0}")]
    Server(String),

    #[error("connection closed before the session opened")]
    ClosedBeforeOpen,
}

/// A single reply chunk could not be turned into audio.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Envelope(String),

    #[error("odd PCM payload length {0}, expected 16-bit samples")]
    OddLength(usize),

    #[error("cannot encode an empty frame")]
    EmptyFrame,
}

/// A single outbound frame could not be handed to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue is full, frame dropped")]
    QueueFull,

    #[error("connection is not in a sendable state")]
    NotSendable,
}

/// The error delivered to the caller's `on_error` callback.
///
/// Receiving one means the session is over; construct a new session to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("session transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("microphone failed during the session: {0}")]
    Capture(#[source] DeviceError),
}

impl SessionError {
    /// Whether the failure happened before the session ever opened.
    pub fn is_setup(&self) -> bool {
        matches!(self, SessionError::Setup(_))
    }
}

/// Shorthand for results carrying a [`SessionError`].
pub type SessionResult<T> = Result<T, SessionError>;
