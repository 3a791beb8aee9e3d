//! Threaded server front-end for the `tandem-http` protocol engine.
//!
//! Wires the engine's two execution contexts to real sockets:
//!
//! - the **background I/O thread** runs a current-thread runtime hosting
//!   the accept loop, the per-socket read/write pumps, and the single
//!   event loop that owns every connection's protocol state
//! - the **handler thread** runs its own current-thread runtime and awaits
//!   application callbacks strictly one at a time
//!
//! The two meet only at the engine's cross-thread callback queue.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Response, StatusCode};
//! use tandem_http::handler::make_app;
//! use tandem_server::Server;
//!
//! let app = make_app(|request: http::Request<Bytes>| async move {
//!     let body = format!("hello from {}\r\n", request.uri().path());
//!     Response::builder()
//!         .status(StatusCode::OK)
//!         .body(Bytes::from(body))
//!         .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
//! });
//!
//! let server = Server::builder()
//!     .address("127.0.0.1:8080")
//!     .application(app)
//!     .build()
//!     .expect("failed to build server");
//!
//! server.run().expect("server failed");
//! ```

mod driver;
mod runner;
mod server;

pub use server::{Server, ServerBuildError, ServerBuilder};
