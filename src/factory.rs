//! Server construction.

use std::future::Future;
use std::net::SocketAddr;

use http::Method;
use tokio::runtime::Handle;

use crate::address::ServerAddress;
use crate::config::ServerOptions;
use crate::error::ServerError;
use crate::handler::Handler;
use crate::server::{HttpServer, HttpsServer, ServerState, WebServer};

/// Which server variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Plain,
    Secure,
}

/// A server of either variant, owned by the caller.
pub enum Server {
    Plain(HttpServer),
    Secure(HttpsServer),
}

impl Server {
    pub fn kind(&self) -> ServerKind {
        match self {
            Server::Plain(_) => ServerKind::Plain,
            Server::Secure(_) => ServerKind::Secure,
        }
    }

    /// Access the TLS overlay, e.g. to call `init_ssl`.
    pub fn secure_mut(&mut self) -> Option<&mut HttpsServer> {
        match self {
            Server::Secure(server) => Some(server),
            Server::Plain(_) => None,
        }
    }

    pub fn state(&self) -> ServerState {
        match self {
            Server::Plain(server) => server.state(),
            Server::Secure(server) => server.state(),
        }
    }

    /// Stop accepting and drain; see [`HttpServer::shutdown`].
    pub fn shutdown(&self) -> impl Future<Output = bool> + Send + 'static {
        let server = match self {
            Server::Plain(server) => server,
            Server::Secure(server) => server.plain(),
        };
        server.shutdown()
    }

    fn as_web_server(&mut self) -> &mut dyn WebServer {
        match self {
            Server::Plain(server) => server,
            Server::Secure(server) => server,
        }
    }
}

impl WebServer for Server {
    fn init(&mut self, address: ServerAddress, context: Handle) -> Result<(), ServerError> {
        self.as_web_server().init(address, context)
    }

    fn init_with_threads(
        &mut self,
        address: ServerAddress,
        threads: usize,
    ) -> Result<(), ServerError> {
        self.as_web_server().init_with_threads(address, threads)
    }

    fn add_handler(
        &mut self,
        path: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), ServerError> {
        self.as_web_server().add_handler(path, method, handler)
    }

    fn run(&mut self) -> Result<(), ServerError> {
        self.as_web_server().run()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Server::Plain(server) => server.local_addr(),
            Server::Secure(server) => server.local_addr(),
        }
    }
}

/// Builds servers bound to a caller-owned runtime.
///
/// The factory keeps no record of what it creates.
#[derive(Debug, Clone, Default)]
pub struct ServerFactory {
    options: ServerOptions,
}

impl ServerFactory {
    pub fn new(options: ServerOptions) -> Self {
        Self { options }
    }

    pub fn create(&self, kind: ServerKind, address: ServerAddress, context: Handle) -> Server {
        let options = self.options.clone();
        match kind {
            ServerKind::Plain => Server::Plain(HttpServer::bound(address, context, options)),
            ServerKind::Secure => Server::Secure(HttpsServer::bound(address, context, options)),
        }
    }
}
