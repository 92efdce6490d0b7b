//! Transport engine abstraction
//!
//! The load generator drives connections and streams through the
//! [`Transport`] trait and reacts to the events the engine delivers to the
//! registered [`ConnectionHandler`] / [`StreamHandler`] objects.
//!
//! # Event delivery contract
//!
//! - All events of one connection, and of every stream on it, are delivered
//!   serially (never two at once), in the order the engine produced them.
//! - Events of different connections may be delivered concurrently on
//!   engine-owned threads.
//! - Transport methods never invoke a handler inline; events triggered by a
//!   call are delivered after the call returns.
//! - A handler is dropped by the engine after its `ShutdownComplete` event.
//! - Statistics of a connection or stream stay readable until its handler
//!   returns from `ShutdownComplete`.
//!
//! Payload slices passed in events are only valid for the duration of the
//! callback. The one exception is the send buffer, which comes back in
//! [`StreamEvent::SendComplete`] as the exact [`Bytes`] handle that was posted.

pub mod loopback;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Engine-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

/// Engine-assigned stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Errors returned by transport calls or reported in shutdown events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused by peer")]
    Refused,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("operation not valid in the current state")]
    InvalidState,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("transport is shut down")]
    Closed,
}

/// Status a handler returns to the engine for each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Pending,
    Error,
}

/// Connection-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake finished; streams may be opened
    Connected,
    /// The engine is closing the connection because of a local failure
    /// (refused, handshake failure, idle timeout)
    ShutdownInitiatedByTransport { error: TransportError },
    /// The peer closed the connection
    ShutdownInitiatedByPeer { error_code: u64 },
    /// Final event; every stream has already seen its own `ShutdownComplete`
    ShutdownComplete,
}

/// Stream-level events. Borrowed data is only valid during the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    StartComplete { status: Status },
    /// A buffer posted with [`Transport::send`] is no longer referenced by the engine
    SendComplete { buffer: Bytes, canceled: bool },
    Receive { data: &'a [u8] },
    /// The peer finished its send direction (FIN received)
    PeerSendShutdown,
    /// The peer aborted its send direction
    PeerSendAborted { error_code: u64 },
    /// Our FIN has been acknowledged
    SendShutdownComplete { graceful: bool },
    /// Final event for the stream
    ShutdownComplete { connection_shutdown: bool },
}

/// Receives connection events from the engine.
pub trait ConnectionHandler: Send + Sync {
    fn on_connection_event(&self, connection: ConnectionId, event: ConnectionEvent) -> Status;
}

/// Receives stream events from the engine.
pub trait StreamHandler: Send + Sync {
    fn on_stream_event(&self, stream: StreamId, event: StreamEvent<'_>) -> Status;
}

/// Engine-wide settings applied before any connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub encryption: bool,
    pub pacing: bool,
    pub send_buffering: bool,
    pub ecn: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            encryption: true,
            pacing: true,
            send_buffering: false,
            ecn: false,
        }
    }
}

/// Where a connection should go, plus opaque routing tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: SocketAddr,
    /// Server name for the handshake
    pub server_name: String,
    /// Connection-ID-embedded routing tag: offset byte followed by the id
    pub cibir_id: Option<Vec<u8>>,
    pub compartment_id: Option<u32>,
    /// Local address to bind instead of letting the engine pick one
    pub local_address: Option<SocketAddr>,
}

impl ConnectTarget {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            server_name: address.ip().to_string(),
            cibir_id: None,
            compartment_id: None,
            local_address: None,
        }
    }
}

/// Per-connection counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    pub local_address: Option<SocketAddr>,
    pub streams_opened: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl fmt::Display for ConnectionStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "streams={} sent={}B received={}B",
            self.streams_opened, self.bytes_sent, self.bytes_received
        )?;
        if let Some(local) = self.local_address {
            write!(f, " local={}", local)?;
        }
        Ok(())
    }
}

/// Per-stream counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatistics {
    /// Buffers posted with [`Transport::send`]
    pub sends: u64,
    pub bytes_sent: u64,
    /// `Receive` events delivered
    pub receives: u64,
    pub bytes_received: u64,
}

impl fmt::Display for StreamStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={}B in {} sends, received={}B in {} events",
            self.bytes_sent, self.sends, self.bytes_received, self.receives
        )
    }
}

/// Transport engine capability consumed by the client.
pub trait Transport: Send + Sync {
    /// Apply engine-wide settings. Called once before the run starts.
    fn configure(&self, settings: &TransportSettings) -> Result<(), TransportError>;

    /// Allocate a connection and register its event handler.
    fn open_connection(&self, handler: Arc<dyn ConnectionHandler>) -> Result<ConnectionId, TransportError>;

    /// Begin the handshake towards `target`.
    fn start_connection(&self, connection: ConnectionId, target: &ConnectTarget) -> Result<(), TransportError>;

    /// Allocate a stream on a connected connection.
    fn open_stream(
        &self,
        connection: ConnectionId,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<StreamId, TransportError>;

    fn start_stream(&self, stream: StreamId) -> Result<(), TransportError>;

    /// Post `buffer` for sending; `fin` closes the send direction after it.
    fn send(&self, stream: StreamId, buffer: Bytes, fin: bool) -> Result<(), TransportError>;

    /// Stop receiving on `stream`; the receive direction counts as finished.
    fn abort_receive(&self, stream: StreamId, error_code: u64) -> Result<(), TransportError>;

    /// Close the connection and every stream on it.
    fn shutdown_connection(&self, connection: ConnectionId, error_code: u64) -> Result<(), TransportError>;

    fn connection_statistics(&self, connection: ConnectionId) -> Result<ConnectionStatistics, TransportError>;

    fn stream_statistics(&self, stream: StreamId) -> Result<StreamStatistics, TransportError>;
}
