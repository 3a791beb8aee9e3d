//! WebSocket frame codec (RFC 6455 §5).
//!
//! Decoding never consumes partial frames: until header, optional extended
//! length, masking key and payload are all buffered, `decode` returns
//! `None` and leaves the buffer untouched. Masked payloads are unmasked in
//! place during the split, so the rest of the engine only ever sees plain
//! payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::WsError;

/// Largest single-frame payload the decoder accepts.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A single decoded (or to-be-encoded) WebSocket frame.
///
/// `mask` records the masking key the frame arrived with (payloads are
/// stored unmasked either way). Server-originated frames leave it `None`;
/// setting it on an outgoing frame produces a client-style masked frame,
/// which the tests use to play the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Text, mask: None, payload: payload.into() }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Binary, mask: None, payload: payload.into() }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Ping, mask: None, payload: payload.into() }
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Pong, mask: None, payload: payload.into() }
    }

    /// A close frame carrying `code` and an empty reason.
    pub fn close(code: u16) -> Self {
        Self { fin: true, opcode: OpCode::Close, mask: None, payload: Bytes::copy_from_slice(&code.to_be_bytes()) }
    }

    /// A close frame without a status code.
    pub fn close_empty() -> Self {
        Self { fin: true, opcode: OpCode::Close, mask: None, payload: Bytes::new() }
    }

    /// The close code carried by a close frame payload, if any.
    ///
    /// An empty payload is a valid close without a code; a single stray
    /// byte is malformed.
    pub fn close_code(&self) -> Result<Option<u16>, WsError> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(WsError::InvalidCloseFrame),
            _ => Ok(Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))),
        }
    }

    /// Reuses this frame with a masking key, as a client would send it.
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }
}

/// Stateless encoder/decoder for WebSocket frames.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];

        if (b0 >> 4) & 0x07 != 0 {
            return Err(WsError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0f).ok_or(WsError::InvalidOpcode(b0 & 0x0f))?;
        let masked = b1 & 0x80 != 0;

        let (payload_len, header_len) = match b1 & 0x7f {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9]]);
                if len >> 63 != 0 {
                    return Err(WsError::FrameTooLarge { len, max: MAX_FRAME_PAYLOAD });
                }
                (len, 10)
            }
            len7 => (u64::from(len7), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(WsError::FragmentedControl);
            }
            if payload_len > 125 {
                return Err(WsError::ControlFrameTooLarge { len: payload_len });
            }
        }
        if payload_len > MAX_FRAME_PAYLOAD as u64 {
            return Err(WsError::FrameTooLarge { len: payload_len, max: MAX_FRAME_PAYLOAD });
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mask = if masked {
            let key = [src[0], src[1], src[2], src[3]];
            src.advance(4);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(payload_len as usize);
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i & 3];
            }
        }

        Ok(Some(Frame { fin, opcode, mask, payload: payload.freeze() }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        dst.reserve(2 + 8 + 4 + len);

        let b0 = (u8::from(frame.fin) << 7) | frame.opcode as u8;
        dst.put_u8(b0);

        let mask_bit = if frame.mask.is_some() { 0x80 } else { 0x00 };
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match frame.mask {
            Some(key) => {
                dst.put_slice(&key);
                for (i, byte) in frame.payload.iter().enumerate() {
                    dst.put_u8(byte ^ key[i & 3]);
                }
            }
            None => dst.put_slice(&frame.payload),
        }

        Ok(())
    }
}
