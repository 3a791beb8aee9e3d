//! Protocol vocabulary shared by the engine's components.
//!
//! # Components
//!
//! - [`RequestHead`]: parsed request line + header set with the metadata the
//!   state machine needs (keep-alive, expect-continue, upgrade detection)
//! - [`events`]: the typed event/action vocabulary crossing the engine's
//!   boundaries ([`Action`], [`AppEvent`], [`ParseEvent`])
//! - [`error`]: the error taxonomy ([`EngineError`], [`ParseError`],
//!   [`SendError`], [`WsError`])
//!
//! Responses are plain `http::Response<Bytes>` values: the handler returns a
//! fully materialized response, the engine serializes it in one piece.

mod error;
mod events;
mod request;

pub use error::{EngineError, ParseError, SendError, WsError};
pub use events::{Action, AppEvent, ConnectionId, ParseEvent, PayloadSize, RequestHandle, RequestId};
pub use request::RequestHead;

use bytes::Bytes;

/// A complete, ready-to-serialize HTTP response.
pub type Response = http::Response<Bytes>;
