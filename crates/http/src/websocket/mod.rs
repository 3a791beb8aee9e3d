//! WebSocket sub-protocol support (RFC 6455).
//!
//! A connection switches to this protocol exactly once, when the upgrade
//! handshake completes; from then on its read path feeds [`FrameCodec`] and
//! its session bookkeeping lives in [`WsSession`].
//!
//! # Components
//!
//! - [`handshake`]: `Sec-WebSocket-Accept` computation and the
//!   `101 Switching Protocols` response
//! - [`frame`]: frame encode/decode with masking and length variants
//! - [`session`]: fragmentation reassembly, ping/pong, close handshake

pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{Frame, FrameCodec, MAX_FRAME_PAYLOAD, OpCode};
pub use session::{MAX_MESSAGE_BYTES, SessionEvent, WsSession};
