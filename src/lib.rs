//! Hearth - an embeddable HTTP/HTTPS server core.
//!
//! A host application creates a server, points it at an address and an
//! execution context, registers path handlers and calls `run`. From then on
//! the handler table is frozen and shared by all connection tasks without
//! locking.
//!
//! ```no_run
//! use hearth::{Handler, HttpServer, ServerAddress};
//! use http::{Method, StatusCode};
//!
//! let mut server = HttpServer::new();
//! server.init_with_threads(ServerAddress::new("127.0.0.1", 8080), 4)?;
//! server.add_handler(
//!     "/status",
//!     Method::GET,
//!     Handler::new(|_req, res| res.text(StatusCode::OK, "ok")),
//! )?;
//! server.run()?;
//! # Ok::<(), hearth::ServerError>(())
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
mod listener;
pub mod runtime;
pub mod server;
pub mod shutdown;
pub mod tls;

pub use address::ServerAddress;
pub use config::ServerOptions;
pub use error::{HandlerError, ServerError};
pub use factory::{Server, ServerFactory, ServerKind};
pub use handler::{FrozenHandlers, Handler, HandlerTable, Request, Responder, Response};
pub use runtime::{ExecutionContext, WorkerPool};
pub use server::{HttpServer, HttpsServer, ServerState, WebServer};
pub use tls::{KeyAgreement, PasswordCallback, TlsContext};
