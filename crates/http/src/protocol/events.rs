//! The typed event vocabulary exchanged between the engine, the reactor and
//! the handler thread.
//!
//! The connection state machine never performs I/O and never calls into the
//! application directly. It consumes byte-level events and emits [`Action`]s
//! for the background I/O thread to execute; application-visible lifecycle
//! events travel inside [`Action::Dispatch`] as [`AppEvent`]s. This keeps
//! every parser callback a pure state transition and confines all side
//! effects to the two driver loops.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::protocol::RequestHead;

/// Identity of one accepted connection: a slot index in the
/// [`ConnectionTable`](crate::connection::ConnectionTable) plus the slot's
/// generation at insertion time.
///
/// Every reactor completion and every cross-thread command carries one of
/// these. A lookup with a stale generation (the slot was freed, possibly
/// reused) comes back empty, which is how late callbacks for a destroyed
/// connection are detected and dropped instead of touching freed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: u32,
    generation: u32,
}

impl ConnectionId {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub(crate) fn slot(&self) -> u32 {
        self.slot
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Per-connection request sequence number.
///
/// Bumped each time a request completes; a response handed back by the
/// handler thread for an earlier sequence number is stale and is discarded
/// without producing bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Addresses one specific request on one specific connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub conn: ConnectionId,
    pub request: RequestId,
}

/// What the I/O thread must do next on behalf of a connection.
///
/// Emitted by [`Connection`](crate::connection::Connection) in response to
/// byte events and queue commands; executed in order by the driver.
#[derive(Debug)]
pub enum Action {
    /// Write these bytes to the socket; completion is reported back via
    /// `on_write_complete`.
    Write(Bytes),
    /// Deliver this event to the handler thread.
    Dispatch(AppEvent),
    /// Tear the socket handle down. Emitted at most once per connection,
    /// and never while a write completion is still outstanding unless the
    /// socket itself already died.
    Close,
}

/// Application-visible lifecycle events, delivered to the handler thread in
/// the order the engine produced them.
#[derive(Debug)]
pub enum AppEvent {
    /// A request's header section is fully parsed. At most one of these is
    /// in flight per connection until the matching response is written.
    Headers { handle: RequestHandle, head: RequestHead, peer: Option<SocketAddr> },
    /// One decoded chunk of the in-flight request's body.
    BodyChunk { handle: RequestHandle, chunk: Bytes },
    /// The in-flight request's message is complete; the handler should now
    /// produce a response (unless it already rejected at the header stage).
    MessageComplete { handle: RequestHandle },
    /// The upgrade handshake finished; the connection now speaks WebSocket.
    WsOpen { conn: ConnectionId },
    /// One complete (possibly reassembled) WebSocket data message.
    WsMessage { conn: ConnectionId, binary: bool, payload: Bytes },
    /// The WebSocket session ended, with the peer's close code if one was
    /// received.
    WsClose { conn: ConnectionId, code: Option<u16> },
    /// The connection is gone; the handler thread must drop its request
    /// context. Always the last event for a connection.
    Closed { conn: ConnectionId },
}

/// Size of an HTTP message payload, as declared by its headers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// Empty payload (no body)
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}

/// One step of progress from the incremental request decoder.
#[derive(Debug)]
pub enum ParseEvent {
    /// The header section parsed; body decoding (if any) starts next.
    Head(RequestHead, PayloadSize),
    /// One decoded chunk of body data.
    Body(Bytes),
    /// The message is complete; the next decode starts a fresh request.
    End,
}
