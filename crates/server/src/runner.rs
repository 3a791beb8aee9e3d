//! The handler thread.
//!
//! All application callbacks run here, strictly one at a time — each
//! awaited to completion before the next event is taken off the channel,
//! even across different connections. The only way anything computed here
//! reaches a socket is a command pushed onto the [`CallbackQueue`].
//!
//! The per-connection [`RequestContext`]s also live (and die) on this
//! thread: one is created lazily when a connection's first request head
//! arrives, reused for every pipelined request after it, and dropped when
//! the connection's final `Closed` event comes through.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

use tandem_http::handler::{Application, Outcome, RequestContext, WebSocketHandle};
use tandem_http::protocol::{AppEvent, ConnectionId, Response};
use tandem_http::queue::{CallbackQueue, Command};

/// Spawns the handler thread with its own current-thread runtime.
pub(crate) fn spawn<A>(app: A, queue: Arc<CallbackQueue>, events: UnboundedReceiver<AppEvent>) -> thread::JoinHandle<()>
where
    A: Application + Send,
{
    thread::Builder::new()
        .name("tandem-handler".to_owned())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("failed to build handler runtime");
            runtime.block_on(run(app, queue, events));
        })
        .expect("failed to spawn handler thread")
}

async fn run<A: Application>(app: A, queue: Arc<CallbackQueue>, mut events: UnboundedReceiver<AppEvent>) {
    let mut contexts: HashMap<ConnectionId, RequestContext> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Headers { handle, head, peer } => {
                let context = match contexts.entry(handle.conn) {
                    Entry::Occupied(entry) => {
                        let context = entry.into_mut();
                        context.begin(handle, head);
                        context
                    }
                    Entry::Vacant(entry) => entry.insert(RequestContext::new(handle, head, peer)),
                };

                if let Some(response) = app.on_headers(context).await {
                    debug!(conn = %handle.conn, "application rejected request at headers");
                    context.set_rejected();
                    queue.push(Command::Respond { handle, response });
                }
            }

            AppEvent::BodyChunk { handle, chunk } => {
                if let Some(context) = contexts.get_mut(&handle.conn) {
                    context.push_chunk(&chunk);
                }
            }

            AppEvent::MessageComplete { handle } => {
                let Some(context) = contexts.get_mut(&handle.conn) else {
                    warn!(conn = %handle.conn, "message complete without a context");
                    continue;
                };
                if context.rejected() {
                    continue;
                }
                let Some(request) = context.take_request() else {
                    warn!(conn = %handle.conn, "message complete without a staged request");
                    continue;
                };

                match app.handle(request, context).await {
                    Ok(Outcome::Response(response)) => queue.push(Command::Respond { handle, response }),
                    Ok(Outcome::AcceptWebSocket) => queue.push(Command::AcceptWebSocket { handle }),
                    Err(e) => {
                        error!(conn = %handle.conn, cause = %e, "application failed, answering 500");
                        queue.push(Command::Respond { handle, response: error_response(StatusCode::INTERNAL_SERVER_ERROR) });
                    }
                }
            }

            AppEvent::WsOpen { conn } => {
                app.on_ws_open(&WebSocketHandle::new(conn, Arc::clone(&queue))).await;
            }

            AppEvent::WsMessage { conn, binary, payload } => {
                app.on_ws_message(&WebSocketHandle::new(conn, Arc::clone(&queue)), binary, payload).await;
            }

            AppEvent::WsClose { conn, code } => {
                app.on_ws_close(&WebSocketHandle::new(conn, Arc::clone(&queue)), code).await;
            }

            AppEvent::Closed { conn } => {
                // the connection's execution environment dies with it, here
                // on the handler thread
                if contexts.remove(&conn).is_some() {
                    debug!(conn = %conn, "request context dropped");
                }
            }
        }
    }
}

fn error_response(status: StatusCode) -> Response {
    http::Response::builder().status(status).body(Bytes::new()).unwrap()
}
