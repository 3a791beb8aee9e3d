use std::io;
use thiserror::Error;

/// Top-level error type for the protocol engine.
///
/// Everything in here is fatal to the connection it occurred on: the engine
/// performs no retries, it surfaces failure by tearing the connection down.
/// Handler rejections and stale responses are *not* errors (see
/// [`crate::connection`]) — the engine recovers from those locally.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("websocket error: {source}")]
    WebSocketError {
        #[from]
        source: WsError,
    },
}

/// Errors raised while parsing the incoming HTTP byte stream.
///
/// A parse error terminates the connection rather than attempting recovery:
/// once the framing is broken there is no trustworthy message boundary left
/// to resynchronize on.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header section of {current_size} bytes exceeds the {max_size} byte limit")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} headers in one request")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("unsupported http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors raised while serializing a response onto the wire.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("unsupported http version: {0:?}")]
    UnsupportedVersion(http::Version),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_response<S: ToString>(str: S) -> Self {
        Self::InvalidResponse { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors raised by the WebSocket frame layer after a successful upgrade.
///
/// Each variant maps to the close code the peer should receive when the
/// session is still writable, see [`WsError::close_code`].
#[derive(Error, Debug)]
pub enum WsError {
    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("control frame payload of {len} bytes exceed the 125 byte limit")]
    ControlFrameTooLarge { len: u64 },

    #[error("control frame is fragmented")]
    FragmentedControl,

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("data frame interleaved with an unfinished fragmented message")]
    InterleavedMessage,

    #[error("frame payload of {len} bytes exceed the limit {max}")]
    FrameTooLarge { len: u64, max: usize },

    #[error("assembled message of {len} bytes exceed the limit {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("text message is not valid utf-8")]
    InvalidUtf8,

    #[error("close frame carries a malformed payload")]
    InvalidCloseFrame,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl WsError {
    /// The RFC 6455 close code this error maps to when a close frame can
    /// still be sent.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidUtf8 => 1007,
            Self::FrameTooLarge { .. } | Self::MessageTooLarge { .. } => 1009,
            _ => 1002,
        }
    }
}
