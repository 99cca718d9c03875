//! # Live Transport
//!
//! The network side of a session, reduced to two channels and an optional
//! close capability so the session engine never depends on a concrete
//! protocol client.
//!
//! ## Message Flow:
//! - **Client → Server**: [`OutboundMessage`] values on `LiveConnection::outbound`
//! - **Server → Client**: [`InboundEvent`] values on `LiveConnection::inbound`
//!
//! `InboundEvent::Opened` marks the end of the session handshake; until it
//! arrives the connection exists but the session is still `Connecting`.

pub mod gemini;

use crate::audio::codec::WireFrame;
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Parameters sent once when the session opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupParams {
    /// Model identifier, without the `models/` prefix
    pub model: String,

    /// Prebuilt voice used for replies
    pub voice: String,

    /// Persona instruction steering reply content and style
    pub persona: String,
}

/// Messages the session pushes to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// One captured frame as realtime input
    Audio(WireFrame),

    /// The microphone stopped; flush any buffered input server-side
    AudioStreamEnd,

    /// Close the connection
    Close,
}

/// Content of one server message. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMessage {
    /// Base64 reply audio chunks (16-bit LE mono at the playback rate), in order
    pub audio: Vec<String>,

    /// The current reply must stop playing immediately
    pub interrupted: bool,

    /// The model finished a reply turn
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && !self.interrupted && !self.turn_complete
    }
}

/// Events the connection delivers to the session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The session handshake completed
    Opened,

    /// A server message
    Message(ServerMessage),

    /// The server closed the connection cleanly
    Closed { reason: Option<String> },

    /// The connection failed
    Failed(TransportError),
}

/// Best-effort close capability of a connection.
#[async_trait]
pub trait CloseConnection: Send + Sync {
    async fn close(&self) -> Result<(), TransportError>;
}

/// An open connection, owned exclusively by one session.
pub struct LiveConnection {
    /// Bounded queue of messages to send; `try_send` never blocks capture
    pub outbound: mpsc::Sender<OutboundMessage>,

    pub inbound: mpsc::Receiver<InboundEvent>,

    /// Not every transport can be closed from this side; `None` is tolerated
    pub closer: Option<Box<dyn CloseConnection>>,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("outbound_closed", &self.outbound.is_closed())
            .field("has_closer", &self.closer.is_some())
            .finish()
    }
}

/// Opens live connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the network connection and send the session-open parameters.
    ///
    /// Returns as soon as the transport is up; the handshake result arrives
    /// later as [`InboundEvent::Opened`] or a failure event.
    async fn connect(
        &self,
        credential: &str,
        setup: &SetupParams,
    ) -> Result<LiveConnection, TransportError>;
}
