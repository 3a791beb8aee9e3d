//! A per-connection HTTP/1.1 + WebSocket protocol engine
//!
//! This crate turns the raw byte stream of one accepted TCP connection into
//! discrete, ordered application events — request-headers-ready, body-chunk,
//! request-complete, WebSocket-message, WebSocket-close — while two
//! execution contexts cooperate: a background I/O thread that owns every
//! socket and all protocol state, and a single cooperative handler thread
//! where all application callbacks run one at a time.
//!
//! # Features
//!
//! - Incremental HTTP/1.1 parsing (fixed-length and chunked bodies) with
//!   strict serialization of pipelined requests
//! - Rejection-before-body: a request answered from its headers keeps the
//!   connection open while the remaining body bytes drain silently
//! - WebSocket upgrade, frame codec, fragmentation reassembly, ping/pong
//!   and the close handshake
//! - Race-free teardown: connections are addressed through a
//!   generation-checked slot table, so late completions and stale
//!   cross-thread responses become no-ops instead of touching freed state
//! - No I/O and no blocking anywhere in the engine — it consumes byte
//!   events and emits typed actions, which makes the whole protocol
//!   machine unit-testable without sockets
//!
//! # Example
//!
//! Driving the engine by hand (the `tandem-server` crate wires these pieces
//! to real sockets and threads):
//!
//! ```
//! use bytes::Bytes;
//! use tandem_http::connection::{Connection, ConnectionTable};
//! use tandem_http::protocol::{Action, AppEvent};
//!
//! let mut table = ConnectionTable::new();
//! let id = table.insert(|id| Connection::new(id, None));
//!
//! let mut actions = Vec::new();
//! let conn = table.get_mut(id).expect("just inserted");
//! conn.on_bytes_received(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), &mut actions);
//!
//! for action in actions {
//!     match action {
//!         // hand to the socket; report completion via on_write_complete
//!         Action::Write(bytes) => drop(bytes),
//!         // forward to the handler thread
//!         Action::Dispatch(AppEvent::Headers { head, .. }) => {
//!             assert_eq!(head.uri().path(), "/");
//!         }
//!         Action::Dispatch(_) => {}
//!         // tear the socket down, then remove the slot
//!         Action::Close => unreachable!("no close for a well-formed request"),
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`connection`]: the per-connection state machine and the slot table —
//!   the core of the engine
//! - [`codec`]: incremental request decoding and response encoding
//! - [`websocket`]: RFC 6455 handshake, frame codec and session state
//! - [`queue`]: the cross-thread callback queue the handler thread answers
//!   through
//! - [`handler`]: the [`Application`](handler::Application) trait and the
//!   per-connection request context
//! - [`protocol`]: shared vocabulary types (events, actions, errors)
//!
//! # Concurrency model
//!
//! Everything in [`connection`] is single-threaded by contract: only the
//! background I/O thread creates, mutates and destroys connections. The
//! handler thread communicates exclusively by pushing typed commands onto
//! the [`queue::CallbackQueue`]; each command names its target connection
//! (and request) by identity, and the I/O thread validates that identity
//! before acting. A response that lost the race against connection
//! teardown or pipelining progress is logged and dropped, never written to
//! the wrong request.
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only (no HTTP/2 or HTTP/3)
//! - No TLS termination (put a proxy in front for HTTPS)
//! - Responses are fully materialized before they are written; there is no
//!   streaming response body support
//! - Maximum header section size: 8KB, maximum number of headers: 64

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod queue;
pub mod websocket;

mod utils;
pub(crate) use utils::ensure;
