//! HTTP request header handling.
//!
//! Wraps the standard `http::Request` type with the per-request metadata the
//! connection state machine needs before it hands the request off: keep-alive
//! semantics, `Expect: 100-continue`, and the WebSocket upgrade headers.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version, header};

/// The head of a single parsed HTTP request.
///
/// Header names are matched case-insensitively and stored case-preserving;
/// repeated names keep their arrival order (the decoder builds the map with
/// `HeaderMap::append`).
#[derive(Debug)]
pub struct RequestHead {
    inner: Request<()>,
}

impl RequestHead {
    /// Consumes the head and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body, converting the head into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether a message body may follow this head.
    ///
    /// Methods that conventionally carry no payload short-circuit the
    /// Content-Length / Transfer-Encoding inspection entirely.
    pub fn may_have_body(&self) -> bool {
        !matches!(self.method(), &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT)
    }

    /// Keep-alive semantics of this request: HTTP/1.1 defaults to
    /// keep-alive, HTTP/1.0 to close, and a `Connection` header overrides
    /// either default.
    pub fn keep_alive(&self) -> bool {
        let default = match self.version() {
            Version::HTTP_11 => true,
            Version::HTTP_10 => false,
            _ => false,
        };
        match self.connection_header_token() {
            Some(token) if token.eq_ignore_ascii_case("close") => false,
            Some(token) if token.eq_ignore_ascii_case("keep-alive") => true,
            _ => default,
        }
    }

    /// Whether the client asked for an interim `100 Continue` before
    /// sending its body.
    pub fn expects_continue(&self) -> bool {
        match self.headers().get(header::EXPECT) {
            Some(value) => value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-"),
            None => false,
        }
    }

    /// The client's `Sec-WebSocket-Key`, if this request is a well-formed
    /// WebSocket upgrade request (RFC 6455 §4.2.1).
    ///
    /// Requires `Connection: Upgrade` (as a token in the comma-separated
    /// list), `Upgrade: websocket` and `Sec-WebSocket-Version: 13`; the key
    /// itself is validated separately during the handshake.
    pub fn websocket_key(&self) -> Option<&str> {
        if !self.connection_header_has_token("upgrade") {
            return None;
        }

        let upgrade = self.headers().get(header::UPGRADE)?;
        if !upgrade.as_bytes().eq_ignore_ascii_case(b"websocket") {
            return None;
        }

        let version = self.headers().get(header::SEC_WEBSOCKET_VERSION)?;
        if version.as_bytes().trim_ascii() != b"13" {
            return None;
        }

        self.headers().get(header::SEC_WEBSOCKET_KEY)?.to_str().ok().map(str::trim)
    }

    fn connection_header_token(&self) -> Option<&str> {
        self.headers().get(header::CONNECTION)?.to_str().ok().map(str::trim)
    }

    fn connection_header_has_token(&self, token: &str) -> bool {
        match self.headers().get(header::CONNECTION).and_then(|value| value.to_str().ok()) {
            Some(value) => value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)),
            None => false,
        }
    }
}

/// Converts request parts into a `RequestHead`.
impl From<Parts> for RequestHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a `RequestHead`.
impl From<Request<()>> for RequestHead {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
