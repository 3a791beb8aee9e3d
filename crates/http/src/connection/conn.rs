//! The per-connection protocol state machine.
//!
//! One [`Connection`] exists per accepted socket and lives entirely on the
//! background I/O thread. It consumes reactor events (`on_bytes_received`,
//! `on_write_complete`, `on_socket_closed`) and queue commands, and emits
//! [`Action`]s for the driver to execute. It never performs I/O, never
//! blocks, and never calls the application directly — which is what makes
//! the whole machine testable without a socket in sight.
//!
//! # Request lifecycle
//!
//! Parsing a request head sets `handling_request` and dispatches the head
//! to the handler thread. Body chunks of that request keep flowing as they
//! arrive, but once its message is complete the parser is parked: bytes of
//! any pipelined successor accumulate unparsed in the read buffer. When the
//! response for the current request has been written, `request_completed`
//! resets the per-request state, bumps the request sequence number, and
//! re-drives the buffered bytes — pipelined requests are therefore handled
//! strictly in arrival order, one at a time.
//!
//! # Rejection before the body completes
//!
//! A handler may answer a request from its headers alone, before the body
//! has been received. The connection keeps parsing the remaining body bytes
//! so the parser cursor stays consistent with the byte stream, but discards
//! the decoded chunks (`ignore_new_data`) instead of dispatching them. The
//! socket stays open: the response may still be in flight, and a pipelined
//! successor request must still parse correctly.
//!
//! # Stale responses
//!
//! Responses cross threads through the callback queue, so by the time one
//! arrives the connection may have moved on (or started closing). Every
//! response carries the [`RequestId`] it answers; a mismatch means the
//! response is stale and it is dropped with a diagnostic instead of being
//! written to the wrong request.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace, warn};

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::protocol::{
    Action, AppEvent, ConnectionId, ParseError, ParseEvent, RequestHandle, RequestHead, RequestId, Response,
};
use crate::queue::Command;
use crate::websocket::frame::{Frame, FrameCodec};
use crate::websocket::handshake;
use crate::websocket::session::{SessionEvent, WsSession};

/// Protocol currently spoken on a connection. Switches to `WebSocket` at
/// most once, when the upgrade handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    WebSocket,
}

/// State machine for a single accepted connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    protocol: Protocol,
    decoder: RequestDecoder,
    encoder: ResponseEncoder,
    ws_codec: FrameCodec,

    /// Bytes received but not yet parsed. While a request is being handled
    /// this doubles as the pipelined-request buffer.
    read_buf: BytesMut,
    bytes_read: u64,

    /// Sequence number of the request currently (or next) in flight.
    request_seq: u64,
    keep_alive: bool,
    upgrade_key: Option<String>,
    ignore_new_data: bool,
    handling_request: bool,
    response_scheduled: bool,
    message_complete: bool,

    ws: Option<WsSession>,
    ws_close_dispatched: bool,

    pending_writes: usize,
    close_after_write: bool,
    closing: bool,
    close_emitted: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            protocol: Protocol::Http,
            decoder: RequestDecoder::new(),
            encoder: ResponseEncoder::new(),
            ws_codec: FrameCodec::new(),
            read_buf: BytesMut::new(),
            bytes_read: 0,
            request_seq: 0,
            keep_alive: true,
            upgrade_key: None,
            ignore_new_data: false,
            handling_request: false,
            response_scheduled: false,
            message_complete: false,
            ws: None,
            ws_close_dispatched: false,
            pending_writes: 0,
            close_after_write: false,
            closing: false,
            close_emitted: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Total bytes delivered by the reactor for this connection.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    fn current_handle(&self) -> RequestHandle {
        RequestHandle { conn: self.id, request: RequestId(self.request_seq) }
    }

    // ---------------------------------------------------------------------
    // Reactor-facing entry points (background thread only)
    // ---------------------------------------------------------------------

    /// Feeds freshly received bytes into the state machine.
    pub fn on_bytes_received(&mut self, bytes: Bytes, out: &mut Vec<Action>) {
        if self.closing {
            trace!(conn = %self.id, len = bytes.len(), "dropping bytes received while closing");
            return;
        }

        self.bytes_read += bytes.len() as u64;
        self.read_buf.extend_from_slice(&bytes);
        self.drive(out);
    }

    /// Completion of one previously emitted [`Action::Write`].
    pub fn on_write_complete(&mut self, status: io::Result<()>, out: &mut Vec<Action>) {
        if self.pending_writes == 0 {
            warn!(conn = %self.id, "write completion without a pending write");
        }
        self.pending_writes = self.pending_writes.saturating_sub(1);

        if let Err(e) = status {
            // transport failure is fatal, even while draining a rejected
            // body — a half-open connection must not leak
            if !self.closing {
                error!(conn = %self.id, cause = %e, "write failed, closing connection");
            }
            self.closing = true;
            self.emit_close(out);
            return;
        }

        if self.closing && self.pending_writes == 0 && self.close_after_write {
            self.emit_close(out);
        }
    }

    /// The reactor observed EOF or a read failure on the socket.
    pub fn on_socket_closed(&mut self, out: &mut Vec<Action>) {
        trace!(conn = %self.id, "socket closed by peer");
        if self.ws.is_some() {
            let code = self.ws.as_ref().and_then(WsSession::close_code);
            self.dispatch_ws_close(code, out);
        }
        self.closing = true;
        self.emit_close(out);
    }

    // ---------------------------------------------------------------------
    // Queue commands (pushed by the handler thread, applied here)
    // ---------------------------------------------------------------------

    /// Applies one drained queue command.
    pub fn apply(&mut self, command: Command, out: &mut Vec<Action>) {
        match command {
            Command::Respond { handle, response } => self.respond(handle.request, response, out),
            Command::AcceptWebSocket { handle } => self.accept_websocket(handle.request, out),
            Command::SendFrame { binary, payload, .. } => self.send_frame(binary, payload, out),
            Command::CloseWebSocket { code, .. } => self.close_websocket(code, out),
            Command::Close { .. } => self.schedule_close_now(out),
        }
    }

    /// Writes the response for `request`, unless the connection has moved
    /// past it — a stale response is discarded without touching the wire.
    fn respond(&mut self, request: RequestId, response: Response, out: &mut Vec<Action>) {
        if !self.response_is_current(request, "response") {
            return;
        }

        if response_requests_close(&response) {
            self.keep_alive = false;
        }

        let bytes = match self.encoder.encode_to_bytes(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(conn = %self.id, cause = %e, "failed to serialize response, closing connection");
                self.begin_close(out);
                return;
            }
        };

        self.response_scheduled = true;
        self.write(bytes, out);

        if self.message_complete {
            self.request_completed(out);
            self.drive(out);
        } else {
            // rejected before the body finished: keep parsing the rest of
            // the message but discard it, the wire position must stay in
            // sync with the parser
            self.ignore_new_data = true;
        }
    }

    /// Completes the WebSocket upgrade for `request`: writes the `101`
    /// handshake response, switches protocol, and replays any frames the
    /// client sent ahead of our acceptance.
    fn accept_websocket(&mut self, request: RequestId, out: &mut Vec<Action>) {
        if !self.response_is_current(request, "websocket accept") {
            return;
        }

        let Some(key) = self.upgrade_key.take() else {
            error!(conn = %self.id, "websocket accept for a request that did not ask to upgrade");
            self.begin_close(out);
            return;
        };

        debug!(conn = %self.id, "upgrading connection to websocket");
        let bytes = match self.encoder.encode_to_bytes(handshake::upgrade_response(&key)) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(conn = %self.id, cause = %e, "failed to serialize upgrade response");
                self.begin_close(out);
                return;
            }
        };

        self.response_scheduled = true;
        self.write(bytes, out);

        self.protocol = Protocol::WebSocket;
        self.ws = Some(WsSession::new());
        self.handling_request = false;
        self.message_complete = false;
        out.push(Action::Dispatch(AppEvent::WsOpen { conn: self.id }));

        // frames an eager client pipelined behind its handshake
        self.drive(out);
    }

    /// Sends one WebSocket data frame, unless the session is shutting down.
    fn send_frame(&mut self, binary: bool, payload: Bytes, out: &mut Vec<Action>) {
        if self.closing || !matches!(&self.ws, Some(session) if session.is_open()) {
            debug!(conn = %self.id, "discarding frame send on a closed or non-websocket connection");
            return;
        }

        let frame = if binary { Frame::binary(payload) } else { Frame::text(payload) };
        self.write_frame(frame, out);
    }

    /// Starts a locally-initiated WebSocket close: sends the close frame
    /// and waits for the peer's close (or socket teardown) before the
    /// handle itself is closed.
    fn close_websocket(&mut self, code: u16, out: &mut Vec<Action>) {
        if self.closing {
            return;
        }
        let Some(session) = self.ws.as_mut() else {
            debug!(conn = %self.id, "websocket close on a non-websocket connection");
            return;
        };

        if session.begin_local_close(code) {
            self.write_frame(Frame::close(code), out);
        }
    }

    /// Thread-safe close requested through the queue: tears the handle
    /// down without waiting for queued writes to flush.
    fn schedule_close_now(&mut self, out: &mut Vec<Action>) {
        if self.closing {
            return;
        }
        debug!(conn = %self.id, "close scheduled from handler thread");
        self.closing = true;
        self.emit_close(out);
    }

    // ---------------------------------------------------------------------
    // HTTP parse loop
    // ---------------------------------------------------------------------

    /// Pulls parse events until input runs out or the machine parks.
    fn drive(&mut self, out: &mut Vec<Action>) {
        loop {
            if self.closing {
                return;
            }
            if self.protocol == Protocol::WebSocket {
                self.drive_ws(out);
                return;
            }
            // a fully parsed request is waiting on its response; leave the
            // tail (the next pipelined request) buffered
            if self.handling_request && self.message_complete {
                return;
            }

            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(ParseEvent::Head(head, _size))) => self.on_headers_complete(head, out),
                Ok(Some(ParseEvent::Body(chunk))) => self.on_body_chunk(chunk, out),
                Ok(Some(ParseEvent::End)) => self.on_message_complete(out),
                Ok(None) => return,
                Err(e) => {
                    self.fatal_error(&e, out);
                    return;
                }
            }
        }
    }

    fn on_headers_complete(&mut self, head: RequestHead, out: &mut Vec<Action>) {
        self.keep_alive = head.keep_alive();
        self.upgrade_key = match head.websocket_key() {
            Some(key) if handshake::validate_key(key) => Some(key.to_owned()),
            _ => None,
        };

        if head.expects_continue() && self.upgrade_key.is_none() {
            self.write(Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"), out);
        }

        trace!(conn = %self.id, method = %head.method(), uri = %head.uri(), "request head complete");
        self.handling_request = true;
        self.message_complete = false;
        self.response_scheduled = false;
        out.push(Action::Dispatch(AppEvent::Headers { handle: self.current_handle(), head, peer: self.peer }));
    }

    fn on_body_chunk(&mut self, chunk: Bytes, out: &mut Vec<Action>) {
        if self.ignore_new_data {
            trace!(conn = %self.id, len = chunk.len(), "discarding body chunk of rejected request");
            return;
        }
        out.push(Action::Dispatch(AppEvent::BodyChunk { handle: self.current_handle(), chunk }));
    }

    fn on_message_complete(&mut self, out: &mut Vec<Action>) {
        self.message_complete = true;

        if self.response_scheduled {
            // the handler already answered (rejection before the body
            // finished); the request is done as soon as its bytes are
            self.request_completed(out);
        } else {
            out.push(Action::Dispatch(AppEvent::MessageComplete { handle: self.current_handle() }));
        }
    }

    /// Resets per-request state after a response has been written, then
    /// lets the caller re-drive the buffered bytes.
    fn request_completed(&mut self, out: &mut Vec<Action>) {
        self.request_seq += 1;
        self.handling_request = false;
        self.response_scheduled = false;
        self.message_complete = false;
        self.ignore_new_data = false;
        self.upgrade_key = None;

        if !self.keep_alive {
            self.begin_close(out);
        }
    }

    fn fatal_error(&mut self, error: &ParseError, out: &mut Vec<Action>) {
        error!(conn = %self.id, cause = %error, "protocol error, closing connection");

        // best effort only: the peer broke framing, it may never see this
        let bad_request = http::Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Bytes::new())
            .unwrap_or_else(|_| unreachable!("statically valid response"));
        if let Ok(bytes) = self.encoder.encode_to_bytes(bad_request) {
            self.write(bytes, out);
        }
        self.begin_close(out);
    }

    // ---------------------------------------------------------------------
    // WebSocket frame loop
    // ---------------------------------------------------------------------

    fn drive_ws(&mut self, out: &mut Vec<Action>) {
        loop {
            if self.closing {
                return;
            }
            match self.ws_codec.decode(&mut self.read_buf) {
                Ok(Some(frame)) => self.on_ws_frame(frame, out),
                Ok(None) => return,
                Err(e) => {
                    self.ws_fatal(&e, out);
                    return;
                }
            }
        }
    }

    fn on_ws_frame(&mut self, frame: Frame, out: &mut Vec<Action>) {
        let Some(session) = self.ws.as_mut() else {
            warn!(conn = %self.id, "websocket frame without a session");
            return;
        };
        let locally_initiated = session.is_local_closing();

        match session.on_frame(frame) {
            Ok(None) => {}

            Ok(Some(SessionEvent::Message { binary, payload })) => {
                out.push(Action::Dispatch(AppEvent::WsMessage { conn: self.id, binary, payload }));
            }

            Ok(Some(SessionEvent::ReplyPong { payload })) => {
                self.write_frame(Frame::pong(payload), out);
            }

            Ok(Some(SessionEvent::PeerClose { code })) => {
                if !locally_initiated {
                    // peer initiated: echo the close before tearing down
                    let echo = match code {
                        Some(code) => Frame::close(code),
                        None => Frame::close_empty(),
                    };
                    self.write_frame(echo, out);
                }
                self.dispatch_ws_close(code, out);
                self.begin_close(out);
            }

            Err(e) => self.ws_fatal(&e, out),
        }
    }

    fn ws_fatal(&mut self, error: &crate::protocol::WsError, out: &mut Vec<Action>) {
        error!(conn = %self.id, cause = %error, "websocket protocol error, closing session");

        let code = error.close_code();
        if matches!(&self.ws, Some(session) if !session.is_closed()) {
            self.write_frame(Frame::close(code), out);
        }
        self.dispatch_ws_close(None, out);
        self.begin_close(out);
    }

    fn dispatch_ws_close(&mut self, code: Option<u16>, out: &mut Vec<Action>) {
        if self.ws_close_dispatched {
            return;
        }
        self.ws_close_dispatched = true;
        out.push(Action::Dispatch(AppEvent::WsClose { conn: self.id, code }));
    }

    // ---------------------------------------------------------------------
    // Write / close plumbing
    // ---------------------------------------------------------------------

    fn write(&mut self, bytes: Bytes, out: &mut Vec<Action>) {
        self.pending_writes += 1;
        out.push(Action::Write(bytes));
    }

    fn write_frame(&mut self, frame: Frame, out: &mut Vec<Action>) {
        let mut buf = BytesMut::new();
        match self.ws_codec.encode(frame, &mut buf) {
            Ok(()) => self.write(buf.freeze(), out),
            Err(e) => {
                error!(conn = %self.id, cause = %e, "failed to encode frame");
                self.begin_close(out);
            }
        }
    }

    /// Graceful close: the handle goes down once in-flight writes drain.
    fn begin_close(&mut self, out: &mut Vec<Action>) {
        self.closing = true;
        if self.pending_writes == 0 {
            self.emit_close(out);
        } else {
            self.close_after_write = true;
        }
    }

    fn emit_close(&mut self, out: &mut Vec<Action>) {
        if self.close_emitted {
            return;
        }
        self.close_emitted = true;
        out.push(Action::Close);
    }

    /// Validates that a request-scoped command still addresses the current
    /// request; anything else is stale and must produce no wire bytes.
    fn response_is_current(&mut self, request: RequestId, what: &str) -> bool {
        if self.closing {
            debug!(conn = %self.id, request = %request, "discarding {what} for a closing connection");
            return false;
        }
        if self.protocol != Protocol::Http {
            debug!(conn = %self.id, request = %request, "discarding {what} after protocol switch");
            return false;
        }
        if !self.handling_request || RequestId(self.request_seq) != request {
            debug!(conn = %self.id, request = %request, current = self.request_seq, "discarding stale {what}");
            return false;
        }
        if self.response_scheduled {
            debug!(conn = %self.id, request = %request, "discarding duplicate {what}");
            return false;
        }
        true
    }
}

/// Whether the response explicitly asks to close the connection.
fn response_requests_close(response: &Response) -> bool {
    match response.headers().get(http::header::CONNECTION) {
        Some(value) => match value.to_str() {
            Ok(text) => text.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")),
            Err(_) => false,
        },
        None => false,
    }
}
