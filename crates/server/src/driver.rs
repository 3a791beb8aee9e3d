//! The background I/O event loop.
//!
//! Runs on the dedicated I/O thread inside a current-thread runtime and is
//! the only code that mutates protocol state. Per-socket read/write pump
//! tasks are dumb byte movers: they forward everything into the single
//! event loop, which routes it through the connection table and executes
//! the [`Action`]s the engine emits. Commands pushed by the handler thread
//! arrive through the [`CallbackQueue`] and are drained between reactor
//! iterations.
//!
//! Teardown sequencing: executing [`Action::Close`] cancels the read pump
//! and closes the write pump's channel, but the table slot stays occupied
//! until both pumps have reported back. Only then is the slot removed (and
//! the slot generation bumped), so no completion still in flight can ever
//! address freed state.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tandem_http::connection::{Connection, ConnectionTable};
use tandem_http::protocol::{Action, AppEvent, ConnectionId};
use tandem_http::queue::CallbackQueue;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Everything the pumps report back into the event loop.
#[derive(Debug)]
enum IoEvent {
    Accepted(TcpStream, SocketAddr),
    Bytes(ConnectionId, Bytes),
    WriteDone(ConnectionId, io::Result<()>),
    SocketClosed(ConnectionId),
    ReaderDone(ConnectionId),
    WriterDone(ConnectionId),
}

/// Driver-side bookkeeping for one socket.
#[derive(Debug)]
struct ConnIo {
    writer_tx: Option<UnboundedSender<Bytes>>,
    cancel: CancellationToken,
    close_requested: bool,
    reader_done: bool,
    writer_done: bool,
}

/// Runs the accept loop and the I/O event loop until the process ends.
pub(crate) async fn run(listener: TcpListener, queue: Arc<CallbackQueue>, app_events: UnboundedSender<AppEvent>) {
    let (io_tx, mut io_rx) = unbounded_channel();

    {
        let io_tx = io_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if io_tx.send(IoEvent::Accepted(stream, peer)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(cause = %e, "failed to accept");
                    }
                }
            }
        });
    }

    let mut table = ConnectionTable::new();
    let mut sockets: HashMap<ConnectionId, ConnIo> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            _ = queue.notified() => {
                for command in queue.drain() {
                    let id = command.conn();
                    let mut actions = Vec::new();
                    match table.get_mut(id) {
                        Some(conn) => conn.apply(command, &mut actions),
                        // the connection went away while the command was queued
                        None => debug!(conn = %id, "dropping command for a gone connection"),
                    }
                    perform(id, actions, &mut table, &mut sockets, &app_events);
                }
            }

            event = io_rx.recv() => {
                let Some(event) = event else { break };
                handle_io_event(event, &io_tx, &mut table, &mut sockets, &app_events);
            }
        }
    }
}

fn handle_io_event(
    event: IoEvent,
    io_tx: &UnboundedSender<IoEvent>,
    table: &mut ConnectionTable,
    sockets: &mut HashMap<ConnectionId, ConnIo>,
    app_events: &UnboundedSender<AppEvent>,
) {
    match event {
        IoEvent::Accepted(stream, peer) => {
            let (reader, writer) = stream.into_split();
            let (writer_tx, writer_rx) = unbounded_channel();
            let cancel = CancellationToken::new();

            let id = table.insert(|id| Connection::new(id, Some(peer)));
            info!(conn = %id, %peer, "accepted connection");

            tokio::spawn(read_pump(reader, id, io_tx.clone(), cancel.clone()));
            tokio::spawn(write_pump(writer, id, io_tx.clone(), writer_rx));

            sockets.insert(id, ConnIo { writer_tx: Some(writer_tx), cancel, close_requested: false, reader_done: false, writer_done: false });
        }

        IoEvent::Bytes(id, bytes) => {
            let mut actions = Vec::new();
            if let Some(conn) = table.get_mut(id) {
                conn.on_bytes_received(bytes, &mut actions);
            }
            perform(id, actions, table, sockets, app_events);
        }

        IoEvent::WriteDone(id, status) => {
            let mut actions = Vec::new();
            if let Some(conn) = table.get_mut(id) {
                conn.on_write_complete(status, &mut actions);
            }
            perform(id, actions, table, sockets, app_events);
        }

        IoEvent::SocketClosed(id) => {
            let mut actions = Vec::new();
            if let Some(conn) = table.get_mut(id) {
                conn.on_socket_closed(&mut actions);
            }
            perform(id, actions, table, sockets, app_events);
        }

        IoEvent::ReaderDone(id) => {
            if let Some(conn_io) = sockets.get_mut(&id) {
                conn_io.reader_done = true;
            }
            maybe_remove(id, table, sockets, app_events);
        }

        IoEvent::WriterDone(id) => {
            if let Some(conn_io) = sockets.get_mut(&id) {
                conn_io.writer_done = true;
            }
            maybe_remove(id, table, sockets, app_events);
        }
    }
}

/// Executes the engine's actions, folding in any follow-up actions produced
/// along the way (e.g. a failed write submission surfacing as a completion).
fn perform(
    id: ConnectionId,
    actions: Vec<Action>,
    table: &mut ConnectionTable,
    sockets: &mut HashMap<ConnectionId, ConnIo>,
    app_events: &UnboundedSender<AppEvent>,
) {
    let mut pending = VecDeque::from(actions);

    while let Some(action) = pending.pop_front() {
        match action {
            Action::Write(bytes) => {
                let submitted = sockets
                    .get(&id)
                    .and_then(|conn_io| conn_io.writer_tx.as_ref())
                    .is_some_and(|tx| tx.send(bytes).is_ok());

                if !submitted {
                    trace!(conn = %id, "write submission failed, writer is gone");
                    if let Some(conn) = table.get_mut(id) {
                        let mut follow_up = Vec::new();
                        conn.on_write_complete(Err(io::Error::from(io::ErrorKind::BrokenPipe)), &mut follow_up);
                        pending.extend(follow_up);
                    }
                }
            }

            Action::Dispatch(event) => {
                if app_events.send(event).is_err() {
                    warn!(conn = %id, "handler thread is gone, dropping event");
                }
            }

            Action::Close => {
                if let Some(conn_io) = sockets.get_mut(&id) {
                    debug!(conn = %id, "closing socket handle");
                    conn_io.close_requested = true;
                    conn_io.cancel.cancel();
                    // already-queued writes still flush, then the write
                    // pump shuts the socket down and reports back
                    conn_io.writer_tx = None;
                }
                maybe_remove(id, table, sockets, app_events);
            }
        }
    }
}

/// Frees a connection's slot once close was requested and both pumps have
/// wound down — the invariant that nothing pending can outlive its slot.
fn maybe_remove(
    id: ConnectionId,
    table: &mut ConnectionTable,
    sockets: &mut HashMap<ConnectionId, ConnIo>,
    app_events: &UnboundedSender<AppEvent>,
) {
    let done = matches!(sockets.get(&id), Some(conn_io) if conn_io.close_requested && conn_io.reader_done && conn_io.writer_done);
    if !done {
        return;
    }

    sockets.remove(&id);
    if table.remove(id).is_some() {
        debug!(conn = %id, "connection destroyed");
    }
    let _ = app_events.send(AppEvent::Closed { conn: id });
}

async fn read_pump(mut reader: OwnedReadHalf, id: ConnectionId, events: UnboundedSender<IoEvent>, cancel: CancellationToken) {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    let _ = events.send(IoEvent::SocketClosed(id));
                    break;
                }
                Ok(_) => {
                    if events.send(IoEvent::Bytes(id, buf.split().freeze())).is_err() {
                        break;
                    }
                    buf.reserve(READ_BUF_SIZE);
                }
                Err(e) => {
                    warn!(conn = %id, cause = %e, "read failed");
                    let _ = events.send(IoEvent::SocketClosed(id));
                    break;
                }
            }
        }
    }
    let _ = events.send(IoEvent::ReaderDone(id));
}

async fn write_pump(mut writer: OwnedWriteHalf, id: ConnectionId, events: UnboundedSender<IoEvent>, mut rx: UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        let result = writer.write_all(&bytes).await;
        let failed = result.is_err();
        let _ = events.send(IoEvent::WriteDone(id, result));
        if failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
    let _ = events.send(IoEvent::WriterDone(id));
}
