//! Incremental HTTP request decoder.
//!
//! This is the engine's "frame parser": it is fed raw bytes and yields a
//! stream of [`ParseEvent`]s — head, body chunks, end of message — without
//! ever reading past the data it has been given. The caller decides how far
//! parsing advances: the connection state machine stops pulling events while
//! a previous request is still being handled, which is what keeps pipelined
//! requests serialized.
//!
//! Header tokenization is delegated to `httparse`; body decoding to the
//! [`PayloadDecoder`](super::body) state machines.

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Request};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::body::{PayloadDecoder, PayloadItem};
use crate::ensure;
use crate::protocol::{ParseError, ParseEvent, PayloadSize, RequestHead};

/// Maximum number of headers accepted in one request.
pub const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes of one request's header section.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decoder for a stream of pipelined HTTP/1.x requests.
///
/// # State machine
///
/// - `payload: None` — waiting for (more of) a header section
/// - `payload: Some(_)` — inside a message body; [`ParseEvent::End`] pops
///   the decoder back to the header phase
#[derive(Debug, Default)]
pub struct RequestDecoder {
    payload: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<ParseEvent>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut parsed = httparse::Request::new(&mut headers);

        let status = parsed.parse(src).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let body_offset = match status {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                // An attacker must not be able to grow the buffer without
                // bound by never finishing the header section.
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };
        trace!(header_bytes = body_offset, "parsed request head");

        ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

        let version = match parsed.version {
            Some(0) => http::Version::HTTP_10,
            Some(1) => http::Version::HTTP_11,
            // HTTP/2 and HTTP/3 don't reach this decoder
            v => return Err(ParseError::InvalidVersion(v)),
        };

        let mut builder = Request::builder()
            .method(http::Method::from_bytes(parsed.method.ok_or(ParseError::InvalidMethod)?.as_bytes()).map_err(|_| ParseError::InvalidMethod)?)
            .uri(parsed.path.ok_or(ParseError::InvalidUri)?)
            .version(version);

        let header_map = builder.headers_mut().ok_or(ParseError::InvalidUri)?;
        header_map.reserve(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| ParseError::invalid_header(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value).map_err(|e| ParseError::invalid_header(e.to_string()))?;
            // append, not insert: duplicate names keep their arrival order
            header_map.append(name, value);
        }

        let head = RequestHead::from(builder.body(()).map_err(|e| ParseError::invalid_header(e.to_string()))?);
        let payload_size = payload_size_from_headers(&head)?;

        // the header section is fully copied into `head`, drop it from the buffer
        let _ = src.split_to(body_offset);

        self.payload = Some(PayloadDecoder::from(payload_size));
        Ok(Some(ParseEvent::Head(head, payload_size)))
    }
}

impl Decoder for RequestDecoder {
    type Item = ParseEvent;
    type Error = ParseError;

    /// Pulls the next parse event out of `src`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(ParseEvent::Head(..)))` — a request's header section parsed
    /// - `Ok(Some(ParseEvent::Body(..)))` — a chunk of body data
    /// - `Ok(Some(ParseEvent::End))` — the current message is complete
    /// - `Ok(None)` — need more data
    /// - `Err(_)` — the stream is unparseable; the connection must close
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload) = &mut self.payload {
            let event = match payload.decode(src)? {
                Some(PayloadItem::Chunk(bytes)) => Some(ParseEvent::Body(bytes)),
                Some(PayloadItem::Eof) => {
                    // message done, next decode starts a fresh header section
                    self.payload.take();
                    Some(ParseEvent::End)
                }
                None => None,
            };
            return Ok(event);
        }

        if src.is_empty() {
            return Ok(None);
        }

        self.decode_head(src)
    }
}

/// Selects the payload framing declared by the request headers
/// (RFC 9112 §6.3).
fn payload_size_from_headers(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    if !head.may_have_body() {
        return Ok(PayloadSize::Empty);
    }

    let te_header = head.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = head.headers().get(http::header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::Empty),

        (Some(te_value), None) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::Chunked)
            } else {
                Ok(PayloadSize::Empty)
            }
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
            let length =
                cl_str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
            if length == 0 { Ok(PayloadSize::Empty) } else { Ok(PayloadSize::Length(length)) }
        }

        (Some(_), Some(_)) => Err(ParseError::invalid_content_length("transfer-encoding and content-length both present")),
    }
}

/// Whether the Transfer-Encoding header ends in `chunked`.
///
/// Chunked must be the final encoding when present (RFC 9112 §6.1).
fn is_chunked(value: &HeaderValue) -> bool {
    match value.as_bytes().rsplit(|b| *b == b',').next() {
        Some(last) => last.trim_ascii().eq_ignore_ascii_case(b"chunked"),
        None => false,
    }
}
