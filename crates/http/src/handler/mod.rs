//! The application-facing handler surface.
//!
//! An [`Application`] runs on the dedicated handler thread, one callback at
//! a time — never concurrently, not even across different connections. It
//! receives lifecycle events for each request and answers by returning
//! values (for the request/response flow) or by enqueueing commands through
//! a [`WebSocketHandle`]; it never touches connection state directly.
//!
//! The [`RequestContext`] is the application's execution environment for
//! one connection: created lazily when the connection's first request
//! arrives, reused across pipelined requests on that connection, and
//! dropped on the handler thread when the connection goes away.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Request, Uri};

use crate::protocol::{ConnectionId, RequestHandle, RequestHead, Response};
use crate::queue::{CallbackQueue, Command};

/// What the application decided to do with a completed request.
#[derive(Debug)]
pub enum Outcome {
    /// Answer with this response and keep (or close, per its headers) the
    /// HTTP connection.
    Response(Response),
    /// Accept the WebSocket upgrade this request asked for.
    AcceptWebSocket,
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

/// A server application.
///
/// All methods run on the single cooperative handler thread; returned
/// futures are awaited to completion before the next event is processed,
/// so implementations never observe concurrent invocations.
#[async_trait(?Send)]
pub trait Application: 'static {
    /// Called as soon as a request's headers are parsed, before its body.
    ///
    /// Returning `Some(response)` rejects the request immediately: the
    /// response goes out while the engine silently drains whatever body
    /// bytes are still inbound, and [`Application::handle`] is never called
    /// for this request.
    async fn on_headers(&self, context: &RequestContext) -> Option<Response> {
        let _ = context;
        None
    }

    /// Called when a request has been fully received.
    ///
    /// Errors are answered with a plain `500 Internal Server Error`.
    async fn handle(&self, request: Request<Bytes>, context: &RequestContext) -> Result<Outcome, Box<dyn Error + Send + Sync>>;

    /// The WebSocket upgrade completed; the session is open.
    async fn on_ws_open(&self, ws: &WebSocketHandle) {
        let _ = ws;
    }

    /// A complete WebSocket data message arrived.
    async fn on_ws_message(&self, ws: &WebSocketHandle, binary: bool, payload: Bytes) {
        let _ = (ws, binary, payload);
    }

    /// The WebSocket session ended, with the peer's close code if known.
    async fn on_ws_close(&self, ws: &WebSocketHandle, code: Option<u16>) {
        let _ = (ws, code);
    }
}

/// The per-connection execution environment handed to the application.
///
/// Holds the in-flight request's head and its incrementally filled body.
/// Reused (reset, not reallocated) for each pipelined request on the same
/// connection.
#[derive(Debug)]
pub struct RequestContext {
    handle: RequestHandle,
    peer: Option<SocketAddr>,
    head: Option<RequestHead>,
    body: BytesMut,
    rejected: bool,
}

impl RequestContext {
    pub fn new(handle: RequestHandle, head: RequestHead, peer: Option<SocketAddr>) -> Self {
        Self { handle, peer, head: Some(head), body: BytesMut::new(), rejected: false }
    }

    /// Re-arms the context for the next pipelined request.
    pub fn begin(&mut self, handle: RequestHandle, head: RequestHead) {
        self.handle = handle;
        self.head = Some(head);
        self.body.clear();
        self.rejected = false;
    }

    /// Appends one body chunk.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        if !self.rejected {
            self.body.extend_from_slice(chunk);
        }
    }

    /// Marks the current request rejected-at-headers; later body chunks
    /// and the message-complete event are ignored for it.
    pub fn set_rejected(&mut self) {
        self.rejected = true;
    }

    pub fn rejected(&self) -> bool {
        self.rejected
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// The peer address the connection was accepted from.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn method(&self) -> Option<&Method> {
        self.head.as_ref().map(RequestHead::method)
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.head.as_ref().map(RequestHead::uri)
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.head.as_ref().map(RequestHead::headers)
    }

    /// Assembles the completed request, consuming the staged head and the
    /// accumulated body.
    pub fn take_request(&mut self) -> Option<Request<Bytes>> {
        let head = self.head.take()?;
        let body = self.body.split().freeze();
        Some(head.body(body))
    }
}

/// Handle through which the application acts on an open WebSocket session.
///
/// Every method is a queue push; the background I/O thread performs the
/// actual frame encoding and writing. Cheap to clone and safe to hold
/// after the session closed — late commands are discarded by the engine.
#[derive(Debug, Clone)]
pub struct WebSocketHandle {
    conn: ConnectionId,
    queue: Arc<CallbackQueue>,
}

impl WebSocketHandle {
    pub fn new(conn: ConnectionId, queue: Arc<CallbackQueue>) -> Self {
        Self { conn, queue }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Sends a text message.
    pub fn send_text(&self, text: impl Into<Bytes>) {
        self.queue.push(Command::SendFrame { conn: self.conn, binary: false, payload: text.into() });
    }

    /// Sends a binary message.
    pub fn send_binary(&self, payload: impl Into<Bytes>) {
        self.queue.push(Command::SendFrame { conn: self.conn, binary: true, payload: payload.into() });
    }

    /// Starts a locally-initiated close with the given status code.
    pub fn close(&self, code: u16) {
        self.queue.push(Command::CloseWebSocket { conn: self.conn, code });
    }
}

/// Adapter turning a plain async `Request -> Response` function into an
/// [`Application`] without WebSocket support.
pub struct AppFn<F> {
    f: F,
}

impl<F> fmt::Debug for AppFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppFn").finish_non_exhaustive()
    }
}

#[async_trait(?Send)]
impl<F, Fut, E> Application for AppFn<F>
where
    F: Fn(Request<Bytes>) -> Fut + 'static,
    Fut: Future<Output = Result<Response, E>>,
    E: Into<Box<dyn Error + Send + Sync>> + 'static,
{
    async fn handle(&self, request: Request<Bytes>, _context: &RequestContext) -> Result<Outcome, Box<dyn Error + Send + Sync>> {
        (self.f)(request).await.map(Outcome::Response).map_err(Into::into)
    }
}

/// Wraps an async function as an application.
pub fn make_app<F, Fut, E>(f: F) -> AppFn<F>
where
    F: Fn(Request<Bytes>) -> Fut + 'static,
    Fut: Future<Output = Result<Response, E>>,
    E: Into<Box<dyn Error + Send + Sync>> + 'static,
{
    AppFn { f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    fn context() -> RequestContext {
        let handle = RequestHandle { conn: ConnectionId::new(0, 0), request: RequestId(0) };
        let head = RequestHead::from(Request::builder().uri("/first").body(()).unwrap());
        RequestContext::new(handle, head, None)
    }

    #[test]
    fn body_accumulates_until_taken() {
        let mut ctx = context();
        ctx.push_chunk(b"hello ");
        ctx.push_chunk(b"world");

        let request = ctx.take_request().unwrap();
        assert_eq!(request.uri().path(), "/first");
        assert_eq!(&request.into_body()[..], b"hello world");

        // consumed; a second take yields nothing until the next begin
        assert!(ctx.take_request().is_none());
    }

    #[test]
    fn rejected_request_stops_accumulating() {
        let mut ctx = context();
        ctx.push_chunk(b"kept");
        ctx.set_rejected();
        ctx.push_chunk(b"dropped");

        assert!(ctx.rejected());
        assert_eq!(&ctx.body[..], b"kept");
    }

    #[test]
    fn begin_resets_for_the_next_request() {
        let mut ctx = context();
        ctx.push_chunk(b"old");
        ctx.set_rejected();

        let next = RequestHandle { conn: ConnectionId::new(0, 0), request: RequestId(1) };
        ctx.begin(next, RequestHead::from(Request::builder().uri("/second").body(()).unwrap()));

        assert!(!ctx.rejected());
        assert_eq!(ctx.uri().unwrap().path(), "/second");
        let request = ctx.take_request().unwrap();
        assert!(request.body().is_empty());
    }

    #[test]
    fn websocket_handle_pushes_commands() {
        let queue = Arc::new(CallbackQueue::new());
        let ws = WebSocketHandle::new(ConnectionId::new(3, 0), Arc::clone(&queue));

        ws.send_text("hi");
        ws.send_binary(Bytes::from_static(&[1, 2]));
        ws.close(1000);

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0], Command::SendFrame { binary: false, .. }));
        assert!(matches!(drained[1], Command::SendFrame { binary: true, .. }));
        assert!(matches!(drained[2], Command::CloseWebSocket { code: 1000, .. }));
    }
}
