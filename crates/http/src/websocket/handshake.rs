//! WebSocket opening handshake (RFC 6455 §4).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::{StatusCode, header};
use sha1::{Digest, Sha1};

use crate::protocol::Response;

/// The GUID appended to `Sec-WebSocket-Key` when computing the accept key.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Whether a `Sec-WebSocket-Key` value is acceptable: base64 that decodes
/// to exactly 16 bytes.
pub fn validate_key(key: &str) -> bool {
    matches!(BASE64.decode(key.trim()), Ok(decoded) if decoded.len() == 16)
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Builds the `101 Switching Protocols` response completing the handshake.
pub fn upgrade_response(key: &str) -> Response {
    http::Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key))
        .body(Bytes::new())
        .unwrap_or_else(|_| unreachable!("statically valid response"))
}
