//! Incremental decoders for HTTP message payloads.
//!
//! Two wire formats are supported, selected from the request headers
//! according to [RFC 9112 §6](https://www.rfc-editor.org/rfc/rfc9112.html):
//! a fixed Content-Length payload and chunked transfer encoding. Messages
//! without a body use the no-op decoder so the caller sees a uniform
//! chunk/EOF stream for every request.

use bytes::{Buf, Bytes, BytesMut};

use crate::protocol::{ParseError, PayloadSize};

/// One step of payload progress: a chunk of body data, or end of message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PayloadItem {
    Chunk(Bytes),
    Eof,
}

/// Unified payload decoder, one per in-flight message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Fixed-size payload: remaining byte count.
    Length(u64),
    Chunked(ChunkedDecoder),
    NoBody,
}

impl PayloadDecoder {
    pub(crate) fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub(crate) fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()) }
    }

    pub(crate) fn fixed_length(size: u64) -> Self {
        Self { kind: Kind::Length(size) }
    }

    /// Decodes the next payload item from `src`.
    ///
    /// Returns `Ok(None)` when more data is needed. Once `Eof` has been
    /// returned the decoder is exhausted and must not be reused.
    pub(crate) fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
        match &mut self.kind {
            Kind::Length(remaining) => {
                if *remaining == 0 {
                    return Ok(Some(PayloadItem::Eof));
                }
                if src.is_empty() {
                    return Ok(None);
                }

                let len = u64::min(*remaining, src.len() as u64);
                let bytes = src.split_to(len as usize).freeze();
                *remaining -= bytes.len() as u64;
                Ok(Some(PayloadItem::Chunk(bytes)))
            }
            Kind::Chunked(decoder) => decoder.decode(src),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => PayloadDecoder::fixed_length(n),
            PayloadSize::Chunked => PayloadDecoder::chunked(),
            PayloadSize::Empty => PayloadDecoder::empty(),
        }
    }
}

/// Decoder for chunked transfer encoding (RFC 9112 §7.1).
///
/// Byte-driven state machine: partial input parks the decoder in its current
/// state and `decode` picks up where it left off when more bytes arrive.
/// Chunk extensions are skipped, trailer fields are consumed and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkedDecoder {
    state: ChunkedState,
    remaining: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Reading the hex chunk size.
    Size,
    /// Skipping a chunk extension (or trailing whitespace) up to CR.
    Extension,
    /// Expecting the LF that ends the size line.
    SizeLf,
    /// Reading chunk data.
    Data,
    /// Expecting the CR after chunk data.
    DataCr,
    /// Expecting the LF after chunk data.
    DataLf,
    /// At the start of a trailer line.
    Trailer,
    /// Skipping a trailer field up to CR.
    TrailerSkip,
    /// Expecting the LF that ends a trailer field.
    TrailerLf,
    /// Expecting the final LF.
    EndLf,
    /// The terminal chunk has been consumed.
    End,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self { state: ChunkedState::Size, remaining: 0 }
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
        use ChunkedState::*;

        loop {
            match self.state {
                End => return Ok(Some(PayloadItem::Eof)),

                Data => {
                    if self.remaining == 0 {
                        self.state = DataCr;
                        continue;
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let len = u64::min(self.remaining, src.len() as u64);
                    let bytes = src.split_to(len as usize).freeze();
                    self.remaining -= bytes.len() as u64;
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                _ => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let byte = src.get_u8();
                    self.state = self.step(byte)?;
                }
            }
        }
    }

    /// Advances past one byte of chunk framing.
    fn step(&mut self, byte: u8) -> Result<ChunkedState, ParseError> {
        use ChunkedState::*;

        let next = match (self.state, byte) {
            (Size, b'0'..=b'9') => self.push_size_digit(byte - b'0')?,
            (Size, b'a'..=b'f') => self.push_size_digit(byte - b'a' + 10)?,
            (Size, b'A'..=b'F') => self.push_size_digit(byte - b'A' + 10)?,
            (Size, b';' | b' ' | b'\t') => Extension,
            (Size, b'\r') => SizeLf,
            (Size, _) => return Err(ParseError::invalid_body("invalid chunk size character")),

            (Extension, b'\r') => SizeLf,
            (Extension, _) => Extension,

            (SizeLf, b'\n') if self.remaining == 0 => Trailer,
            (SizeLf, b'\n') => Data,
            (SizeLf, _) => return Err(ParseError::invalid_body("missing LF after chunk size")),

            (DataCr, b'\r') => DataLf,
            (DataCr, _) => return Err(ParseError::invalid_body("missing CR after chunk data")),
            (DataLf, b'\n') => Size,
            (DataLf, _) => return Err(ParseError::invalid_body("missing LF after chunk data")),

            (Trailer, b'\r') => EndLf,
            (Trailer, _) => TrailerSkip,
            (TrailerSkip, b'\r') => TrailerLf,
            (TrailerSkip, _) => TrailerSkip,
            (TrailerLf, b'\n') => Trailer,
            (TrailerLf, _) => return Err(ParseError::invalid_body("missing LF after trailer field")),

            (EndLf, b'\n') => End,
            (EndLf, _) => return Err(ParseError::invalid_body("missing final LF of chunked body")),

            (Data | End, _) => unreachable!("data and terminal states do not consume framing bytes"),
        };

        Ok(next)
    }

    fn push_size_digit(&mut self, value: u8) -> Result<ChunkedState, ParseError> {
        self.remaining = self
            .remaining
            .checked_mul(16)
            .and_then(|size| size.checked_add(u64::from(value)))
            .ok_or_else(|| ParseError::invalid_body("chunk size overflow"))?;
        Ok(ChunkedState::Size)
    }
}
