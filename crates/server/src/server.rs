//! Server front-end: binds the listening socket and owns the two threads
//! the engine's concurrency model is built on — the background I/O thread
//! (reactor + connection state) and the cooperative handler thread.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tracing::info;

use tandem_http::handler::Application;
use tandem_http::queue::CallbackQueue;

use crate::{driver, runner};

pub struct ServerBuilder<A> {
    address: Option<Vec<SocketAddr>>,
    app: Option<A>,
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("address must be set")]
    MissingAddress,
    #[error("application must be set")]
    MissingApplication,
    #[error("failed to bind: {0}")]
    Bind(#[from] io::Error),
}

impl<A> ServerBuilder<A>
where
    A: Application + Send,
{
    fn new() -> Self {
        Self { address: None, app: None }
    }

    pub fn address<T: ToSocketAddrs>(mut self, address: T) -> Self {
        self.address = Some(address.to_socket_addrs().unwrap().collect::<Vec<_>>());
        self
    }

    pub fn application(mut self, app: A) -> Self {
        self.app = Some(app);
        self
    }

    /// Binds the listening socket and assembles the server. The socket is
    /// live (connections queue up) from this point; they are served once
    /// [`Server::run`] starts.
    pub fn build(self) -> Result<Server<A>, ServerBuildError> {
        let address = self.address.ok_or(ServerBuildError::MissingAddress)?;
        let app = self.app.ok_or(ServerBuildError::MissingApplication)?;
        let listener = StdTcpListener::bind(address.as_slice())?;
        Ok(Server { listener, app })
    }
}

pub struct Server<A> {
    listener: StdTcpListener,
    app: A,
}

impl<A> Server<A>
where
    A: Application + Send,
{
    pub fn builder() -> ServerBuilder<A> {
        ServerBuilder::new()
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the server: spawns the handler thread, then turns the calling
    /// thread into the background I/O thread. Does not return in normal
    /// operation.
    pub fn run(self) -> io::Result<()> {
        let _ = tracing_subscriber::fmt().try_init();

        let queue = Arc::new(CallbackQueue::new());
        let (app_tx, app_rx) = unbounded_channel();
        let _handler_thread = runner::spawn(self.app, Arc::clone(&queue), app_rx);

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(async move {
            self.listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(self.listener)?;
            let address = listener.local_addr()?;
            info!(%address, "start listening");

            driver::run(listener, queue, app_tx).await;
            Ok(())
        })
    }
}
