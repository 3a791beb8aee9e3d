//! HTTP response serialization.
//!
//! Responses handed back by the application are fully materialized
//! (`http::Response<Bytes>`), so encoding is a single pass: status line,
//! headers with Content-Length fixed up, blank line, body. Only HTTP/1.1
//! responses are produced; requests parsed as HTTP/1.0 are answered with
//! HTTP/1.1 framing, which RFC 9110 permits.

use std::io;
use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};
use http::{StatusCode, Version, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::{Response, SendError};

/// Initial buffer capacity reserved per encoded response.
const INIT_RESPONSE_SIZE: usize = 4 * 1024;

/// Encoder for complete HTTP responses implementing the [`Encoder`] trait.
#[derive(Debug, Default)]
pub struct ResponseEncoder;

impl ResponseEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Convenience wrapper producing a frozen byte chunk ready for the
    /// write path.
    pub fn encode_to_bytes(&mut self, response: Response) -> Result<Bytes, SendError> {
        let mut dst = BytesMut::new();
        self.encode(response, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl Encoder<Response> for ResponseEncoder {
    type Error = SendError;

    /// Serializes one response into `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the response carries an HTTP version other than
    /// HTTP/1.0 or HTTP/1.1, or if a status code without a canonical reason
    /// phrase is used.
    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, body) = response.into_parts();

        match head.version {
            Version::HTTP_10 | Version::HTTP_11 => {}
            v => {
                error!(http_version = ?v, "unsupported response version");
                return Err(SendError::UnsupportedVersion(v));
            }
        }

        dst.reserve(INIT_RESPONSE_SIZE + body.len());

        let reason = head.status.canonical_reason().ok_or_else(|| SendError::invalid_response("status without canonical reason"))?;
        write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", head.status.as_str(), reason).map_err(SendError::io)?;

        if body_forbidden(head.status) {
            // 1xx/204/304 must not carry a body, and 101 in particular must
            // not advertise a length for the stream that follows it
            head.headers.remove(header::CONTENT_LENGTH);
        } else {
            match head.headers.get_mut(header::CONTENT_LENGTH) {
                Some(value) => *value = body.len().into(),
                None => {
                    head.headers.insert(header::CONTENT_LENGTH, body.len().into());
                }
            }
        }

        for (name, value) in head.headers.iter() {
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");

        if !body_forbidden(head.status) {
            dst.put_slice(&body);
        }

        Ok(())
    }
}

fn body_forbidden(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

/// Writer over `BytesMut` that skips the io::Write error plumbing; the
/// buffer has already been reserved.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response as HttpResponse;

    fn encode(response: Response) -> String {
        let bytes = ResponseEncoder::new().encode_to_bytes(response).unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_response_with_body() {
        let response = HttpResponse::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let text = encode(response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn content_length_header_is_overwritten() {
        let response = HttpResponse::builder()
            .status(StatusCode::OK)
            .header("Content-Length", "999")
            .body(Bytes::from_static(b"ok"))
            .unwrap();

        let text = encode(response);
        assert!(text.contains("content-length: 2\r\n"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn switching_protocols_has_no_length_and_no_body() {
        let response = HttpResponse::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .body(Bytes::new())
            .unwrap();

        let text = encode(response);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(!text.to_ascii_lowercase().contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn empty_body_gets_zero_length() {
        let response = HttpResponse::builder().status(StatusCode::OK).body(Bytes::new()).unwrap();
        let text = encode(response);
        assert!(text.contains("content-length: 0\r\n"));
    }
}
