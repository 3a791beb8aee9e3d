//! The cross-thread callback queue.
//!
//! The handler thread never touches connection state. Its only way to
//! affect a connection — write a response, send a WebSocket frame, close
//! the socket — is to push a [`Command`] here; the background I/O thread
//! drains the queue between reactor iterations and applies each command
//! with the connection state machine as the sole mutator. The mutex around
//! the queue is the one piece of lock discipline in the whole engine.
//!
//! Every command carries the target [`ConnectionId`] (and, when
//! request-scoped, the [`RequestHandle`]); the I/O thread validates both
//! against the connection table before acting, so commands aimed at a
//! connection that has moved on or been torn down are discarded instead of
//! acting on the wrong request.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::protocol::{ConnectionId, RequestHandle, Response};

/// A deferred action targeted at the background I/O thread.
#[derive(Debug)]
pub enum Command {
    /// Write this response for the identified request. Discarded as stale
    /// when the connection has already advanced past the request.
    Respond { handle: RequestHandle, response: Response },
    /// Complete the WebSocket upgrade handshake for the identified request.
    AcceptWebSocket { handle: RequestHandle },
    /// Send one WebSocket data frame.
    SendFrame { conn: ConnectionId, binary: bool, payload: Bytes },
    /// Start a locally-initiated WebSocket close with this code.
    CloseWebSocket { conn: ConnectionId, code: u16 },
    /// Tear the connection down.
    Close { conn: ConnectionId },
}

impl Command {
    /// The connection this command targets.
    pub fn conn(&self) -> ConnectionId {
        match self {
            Command::Respond { handle, .. } | Command::AcceptWebSocket { handle } => handle.conn,
            Command::SendFrame { conn, .. } | Command::CloseWebSocket { conn, .. } | Command::Close { conn } => *conn,
        }
    }
}

/// Thread-safe FIFO of [`Command`]s, drained on the I/O thread.
#[derive(Debug, Default)]
pub struct CallbackQueue {
    commands: Mutex<VecDeque<Command>>,
    notify: Notify,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a command and wakes the I/O thread. Callable from any
    /// thread; never blocks beyond the queue mutex.
    pub fn push(&self, command: Command) {
        self.commands.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_back(command);
        self.notify.notify_one();
    }

    /// Takes every queued command, preserving push order.
    pub fn drain(&self) -> VecDeque<Command> {
        std::mem::take(&mut *self.commands.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Resolves once a push has happened since the last drain. A push that
    /// raced ahead of this call leaves a stored permit, so wake-ups are
    /// never lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
