//! Per-connection WebSocket session state.
//!
//! [`WsSession`] is the protocol sub-state machine the connection switches
//! to after a successful upgrade. It owns message reassembly and the close
//! handshake bookkeeping; actual frame I/O stays with the connection, which
//! feeds decoded frames in and turns the returned [`SessionEvent`]s into
//! writes and application dispatches.

use bytes::{Bytes, BytesMut};

use crate::protocol::WsError;
use crate::websocket::frame::{Frame, OpCode};

/// Largest reassembled message the session accepts.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// What a received frame amounts to, once session state is applied.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A complete data message (single frame or reassembled fragments).
    Message { binary: bool, payload: Bytes },
    /// A ping arrived; answer with this pong payload.
    ReplyPong { payload: Bytes },
    /// The peer sent a close frame. If the session was still open an echo
    /// close must be written before tearing the socket down; if we had
    /// already initiated the close this is the acknowledgement.
    PeerClose { code: Option<u16> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// We sent (or are about to send) a close frame and are waiting for the
    /// peer's close in return.
    LocalClosing,
    /// The peer's close frame has been seen; the session is over.
    Closed,
}

/// WebSocket session state machine.
#[derive(Debug)]
pub struct WsSession {
    state: State,
    fragment: Option<Fragment>,
    close_code: Option<u16>,
}

#[derive(Debug)]
struct Fragment {
    binary: bool,
    data: BytesMut,
}

impl Default for WsSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WsSession {
    pub fn new() -> Self {
        Self { state: State::Open, fragment: None, close_code: None }
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Whether we initiated the close and are waiting for the peer's echo.
    pub fn is_local_closing(&self) -> bool {
        self.state == State::LocalClosing
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// The close code the session ended with, once one is known.
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// Starts a locally-initiated close. Returns false when a close is
    /// already under way and no further close frame should be written.
    pub fn begin_local_close(&mut self, code: u16) -> bool {
        match self.state {
            State::Open => {
                self.state = State::LocalClosing;
                self.close_code = Some(code);
                true
            }
            State::LocalClosing | State::Closed => false,
        }
    }

    /// Applies one decoded frame to the session.
    ///
    /// Client-to-server frames must be masked (RFC 6455 §5.1); the
    /// connection closes the socket on any returned error after attempting
    /// to send the matching close code.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Option<SessionEvent>, WsError> {
        if self.state == State::Closed {
            return Ok(None);
        }
        if frame.mask.is_none() {
            return Err(WsError::UnmaskedFrame);
        }

        match frame.opcode {
            OpCode::Ping => Ok(Some(SessionEvent::ReplyPong { payload: frame.payload })),

            OpCode::Pong => Ok(None),

            OpCode::Close => {
                let code = frame.close_code()?;
                self.close_code = self.close_code.or(code);
                self.state = State::Closed;
                Ok(Some(SessionEvent::PeerClose { code }))
            }

            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WsError::InterleavedMessage);
                }
                let binary = frame.opcode == OpCode::Binary;
                if frame.fin {
                    if !binary {
                        ensure_utf8(&frame.payload)?;
                    }
                    return Ok(Some(SessionEvent::Message { binary, payload: frame.payload }));
                }

                let mut data = BytesMut::with_capacity(frame.payload.len());
                data.extend_from_slice(&frame.payload);
                self.fragment = Some(Fragment { binary, data });
                Ok(None)
            }

            OpCode::Continuation => {
                let Some(fragment) = self.fragment.as_mut() else {
                    return Err(WsError::UnexpectedContinuation);
                };

                let len = fragment.data.len().saturating_add(frame.payload.len());
                if len > MAX_MESSAGE_BYTES {
                    self.fragment = None;
                    return Err(WsError::MessageTooLarge { len, max: MAX_MESSAGE_BYTES });
                }
                fragment.data.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                let Fragment { binary, data } = self.fragment.take().unwrap_or_else(|| unreachable!("fragment checked above"));
                let payload = data.freeze();
                if !binary {
                    ensure_utf8(&payload)?;
                }
                Ok(Some(SessionEvent::Message { binary, payload }))
            }
        }
    }
}

fn ensure_utf8(payload: &[u8]) -> Result<(), WsError> {
    std::str::from_utf8(payload).map(|_| ()).map_err(|_| WsError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0xa0, 0xa1, 0xa2, 0xa3];

    fn masked(frame: Frame) -> Frame {
        frame.masked(MASK)
    }

    #[test]
    fn single_frame_message() {
        let mut session = WsSession::new();
        let event = session.on_frame(masked(Frame::text(&b"hi"[..]))).unwrap();
        assert_eq!(event, Some(SessionEvent::Message { binary: false, payload: Bytes::from_static(b"hi") }));
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let mut session = WsSession::new();
        assert!(matches!(session.on_frame(Frame::text(&b"hi"[..])), Err(WsError::UnmaskedFrame)));
    }

    #[test]
    fn fragmented_message_is_reassembled() {
        let mut session = WsSession::new();

        let first = Frame { fin: false, opcode: OpCode::Binary, mask: Some(MASK), payload: Bytes::from_static(b"abc") };
        assert_eq!(session.on_frame(first).unwrap(), None);

        let middle = Frame { fin: false, opcode: OpCode::Continuation, mask: Some(MASK), payload: Bytes::from_static(b"def") };
        assert_eq!(session.on_frame(middle).unwrap(), None);

        let last = Frame { fin: true, opcode: OpCode::Continuation, mask: Some(MASK), payload: Bytes::from_static(b"ghi") };
        let event = session.on_frame(last).unwrap();
        assert_eq!(event, Some(SessionEvent::Message { binary: true, payload: Bytes::from_static(b"abcdefghi") }));
    }

    #[test]
    fn control_frames_pass_through_mid_fragmentation() {
        let mut session = WsSession::new();

        let first = Frame { fin: false, opcode: OpCode::Text, mask: Some(MASK), payload: Bytes::from_static(b"par") };
        assert_eq!(session.on_frame(first).unwrap(), None);

        let event = session.on_frame(masked(Frame::ping(&b"tick"[..]))).unwrap();
        assert_eq!(event, Some(SessionEvent::ReplyPong { payload: Bytes::from_static(b"tick") }));

        let last = Frame { fin: true, opcode: OpCode::Continuation, mask: Some(MASK), payload: Bytes::from_static(b"tial") };
        let event = session.on_frame(last).unwrap();
        assert_eq!(event, Some(SessionEvent::Message { binary: false, payload: Bytes::from_static(b"partial") }));
    }

    #[test]
    fn new_data_frame_during_fragmentation_is_rejected() {
        let mut session = WsSession::new();
        let first = Frame { fin: false, opcode: OpCode::Text, mask: Some(MASK), payload: Bytes::from_static(b"a") };
        session.on_frame(first).unwrap();

        assert!(matches!(session.on_frame(masked(Frame::text(&b"b"[..]))), Err(WsError::InterleavedMessage)));
    }

    #[test]
    fn stray_continuation_is_rejected() {
        let mut session = WsSession::new();
        let stray = Frame { fin: true, opcode: OpCode::Continuation, mask: Some(MASK), payload: Bytes::from_static(b"x") };
        assert!(matches!(session.on_frame(stray), Err(WsError::UnexpectedContinuation)));
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        let mut session = WsSession::new();
        let frame = Frame { fin: true, opcode: OpCode::Text, mask: Some(MASK), payload: Bytes::from_static(&[0xff, 0xfe]) };
        match session.on_frame(frame) {
            Err(e @ WsError::InvalidUtf8) => assert_eq!(e.close_code(), 1007),
            other => panic!("expected utf-8 error, got {other:?}"),
        }
    }

    #[test]
    fn peer_close_then_frames_are_ignored() {
        let mut session = WsSession::new();
        let event = session.on_frame(masked(Frame::close(1000))).unwrap();
        assert_eq!(event, Some(SessionEvent::PeerClose { code: Some(1000) }));
        assert!(session.is_closed());
        assert_eq!(session.close_code(), Some(1000));

        assert_eq!(session.on_frame(masked(Frame::text(&b"late"[..]))).unwrap(), None);
    }

    #[test]
    fn local_close_acknowledged_by_peer_close() {
        let mut session = WsSession::new();
        assert!(session.begin_local_close(1001));
        assert!(session.is_local_closing());
        // a second local close is a no-op
        assert!(!session.begin_local_close(1000));

        let event = session.on_frame(masked(Frame::close(1001))).unwrap();
        assert_eq!(event, Some(SessionEvent::PeerClose { code: Some(1001) }));
        assert!(session.is_closed());
        assert_eq!(session.close_code(), Some(1001));
    }
}
