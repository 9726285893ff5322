//! Transport Abstraction
//!
//! Hides the network mechanism behind peer-agnostic send/receive traits.
//! Implementations push [`TransportEvent`]s into an unbounded channel that
//! the owning coordinator or client drains on its own tick, so all protocol
//! state is mutated from a single logical thread.
//!
//! Delivery contract: the reliable channel is ordered per sender; the
//! unreliable channel may drop or reorder and callers must tolerate that.
//! Failures surface as [`TransportEvent::Error`], never silently - except
//! unreliable-channel loss, which is an accepted condition.

pub mod memory;
pub mod ws;

use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level client identifier, unique per session lifetime.
pub type ClientId = u8;

/// Client id conventionally used for the authority endpoint.
pub const SERVER_CLIENT_ID: ClientId = 0;

/// Delivery class for an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Guaranteed, per-sender ordered delivery. Used for turn data and
    /// every handshake message.
    Reliable,
    /// No delivery or ordering guarantee. Used for latency probes.
    Unreliable,
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The endpoint is not connected.
    #[error("not connected")]
    NotConnected,

    /// No client with the given identifier.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// The send could not be handed to the network layer.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The underlying connection was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No free client identifier remains.
    #[error("connection limit reached")]
    ConnectionLimitReached,
}

/// Tagged notification from a transport to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer connected. On the server the id names the new client; on a
    /// client it is [`SERVER_CLIENT_ID`].
    Connected {
        /// Peer identifier.
        client: ClientId,
    },
    /// A peer disconnected.
    Disconnected {
        /// Peer identifier.
        client: ClientId,
    },
    /// A payload arrived.
    Message {
        /// Sending peer.
        sender: ClientId,
        /// Raw message bytes (tag byte included).
        payload: Vec<u8>,
    },
    /// A transport failure was observed.
    Error(TransportError),
}

/// Receiving end of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending end used internally by transport implementations.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Authority-side transport: one endpoint, many connected clients.
pub trait ServerTransport: Send + Sync {
    /// Send a payload to one client. Non-blocking; delivery failures are
    /// reported through the event stream.
    fn send_to(
        &self,
        client: ClientId,
        channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Drop a client connection.
    fn disconnect_client(&self, client: ClientId);
}

/// Client-side transport: a single connection to the authority.
pub trait ClientTransport: Send {
    /// Send a payload to the authority. Non-blocking.
    fn send(&self, channel: ChannelKind, payload: &[u8]) -> Result<(), TransportError>;

    /// Close the connection.
    fn disconnect(&self);

    /// Estimated milliseconds elapsed since the authority stamped
    /// `server_timestamp`, derived from measured latency. Used to start
    /// the local scheduler clock relative to the authority's clock.
    fn delay_ms(&self, server_timestamp: i64) -> i64;
}
