//! Connection lifecycle and state management.
//!
//! # Components
//!
//! - [`Connection`]: the per-socket protocol state machine. Consumes
//!   reactor events and queue commands on the background I/O thread, emits
//!   [`Action`](crate::protocol::Action)s for the driver to execute.
//!   Handles request parsing, pipelining serialization,
//!   rejection draining, the WebSocket upgrade and framing, and teardown
//!   sequencing.
//! - [`ConnectionTable`]: generation-checked slot table that owns every
//!   live connection and turns callbacks for dead connections into no-ops.

mod conn;
mod registry;

pub use conn::{Connection, Protocol};
pub use registry::ConnectionTable;
