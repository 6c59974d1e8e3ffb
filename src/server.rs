//! Plain and secure servers.
//!
//! Both variants share one lifecycle:
//!
//! 1. initialize with an address and an execution context;
//! 2. register handlers;
//! 3. `run`, which binds the address, freezes the handler table and starts
//!    accepting.
//!
//! The transition to running happens once. Registration and initialization
//! fail with [`ServerError::AlreadyRunning`] afterwards. Shutdown happens by
//! dropping the server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http::Method;
use tokio::runtime::Handle;

use crate::address::ServerAddress;
use crate::config::ServerOptions;
use crate::error::ServerError;
use crate::handler::{Handler, HandlerTable};
use crate::listener::{self, Listener, Transport};
use crate::runtime::{ExecutionContext, WorkerPool};
use crate::tls::{PasswordCallback, TlsContext};

/// Operations shared by every server variant.
pub trait WebServer {
    /// Use a caller-owned runtime. The server never stops it.
    fn init(&mut self, address: ServerAddress, context: Handle) -> Result<(), ServerError>;

    /// Create and own a worker pool of `threads` threads.
    fn init_with_threads(&mut self, address: ServerAddress, threads: usize)
        -> Result<(), ServerError>;

    /// Register a handler. Only allowed before `run`.
    fn add_handler(&mut self, path: &str, method: Method, handler: Handler)
        -> Result<(), ServerError>;

    /// Bind and start accepting connections.
    fn run(&mut self) -> Result<(), ServerError>;

    /// Bound socket address, once running.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Running,
}

enum Lifecycle {
    Unstarted(HandlerTable),
    Running(Listener),
}

/// HTTP server over plain TCP.
pub struct HttpServer {
    address: Option<ServerAddress>,
    state: Lifecycle,
    options: ServerOptions,
    // Dropped last so connections can drain on an owned pool.
    context: Option<ExecutionContext>,
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServer {
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        Self {
            address: None,
            state: Lifecycle::Unstarted(HandlerTable::new()),
            options,
            context: None,
        }
    }

    pub(crate) fn bound(address: ServerAddress, context: Handle, options: ServerOptions) -> Self {
        let mut server = Self::with_options(options);
        server.address = Some(address);
        server.context = Some(ExecutionContext::External(context));
        server
    }

    pub fn init(&mut self, address: ServerAddress, context: Handle) -> Result<(), ServerError> {
        self.ensure_configurable()?;
        self.set_context(address, ExecutionContext::External(context))
    }

    pub fn init_with_threads(
        &mut self,
        address: ServerAddress,
        threads: usize,
    ) -> Result<(), ServerError> {
        self.ensure_configurable()?;
        if self.context.is_some() {
            return Err(ServerError::AlreadyInitialized);
        }
        let pool = WorkerPool::new(threads, self.options.shutdown_grace)?;
        self.set_context(address, ExecutionContext::Owned(pool))
    }

    fn set_context(
        &mut self,
        address: ServerAddress,
        context: ExecutionContext,
    ) -> Result<(), ServerError> {
        if self.context.is_some() {
            return Err(ServerError::AlreadyInitialized);
        }
        tracing::debug!(%address, owned = context.is_owned(), "Server initialized");
        self.address = Some(address);
        self.context = Some(context);
        Ok(())
    }

    pub fn add_handler(
        &mut self,
        path: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), ServerError> {
        match &mut self.state {
            Lifecycle::Unstarted(table) => {
                tracing::debug!(path, %method, "Registered handler");
                table.register(path, method, handler);
                Ok(())
            }
            Lifecycle::Running(_) => Err(ServerError::AlreadyRunning),
        }
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        self.start(Transport::Plain)
    }

    /// Bind, freeze the handler table and spawn the accept loop.
    ///
    /// The table is only frozen after the bind succeeds, so a failed start
    /// leaves the server unstarted with its handlers intact.
    pub(crate) fn start(&mut self, transport: Transport) -> Result<(), ServerError> {
        self.ensure_configurable()?;
        let (address, context) = match (&self.address, &self.context) {
            (Some(address), Some(context)) => (address, context),
            _ => return Err(ServerError::NoExecutionContext),
        };

        let handle = context.handle();
        let socket = listener::bind(address, &handle)?;

        let Lifecycle::Unstarted(table) = &mut self.state else {
            return Err(ServerError::AlreadyRunning);
        };
        let handlers = Arc::new(std::mem::take(table).freeze());

        tracing::info!(
            %address,
            local_addr = %socket.local_addr(),
            "Server running"
        );

        let listener = socket.start(&handle, handlers, transport, self.options.clone());
        self.state = Lifecycle::Running(listener);
        Ok(())
    }

    fn ensure_configurable(&self) -> Result<(), ServerError> {
        match self.state {
            Lifecycle::Unstarted(_) => Ok(()),
            Lifecycle::Running(_) => Err(ServerError::AlreadyRunning),
        }
    }

    pub fn state(&self) -> ServerState {
        match self.state {
            Lifecycle::Unstarted(_) => ServerState::Unstarted,
            Lifecycle::Running(_) => ServerState::Running,
        }
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.address.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            Lifecycle::Running(listener) => Some(listener.local_addr()),
            Lifecycle::Unstarted(_) => None,
        }
    }

    pub fn execution_context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    /// Owned worker pool, if the server was initialized with a thread count.
    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        match &self.context {
            Some(ExecutionContext::Owned(pool)) => Some(pool),
            _ => None,
        }
    }

    /// Handlers registered so far; zero once running.
    pub fn pending_handlers(&self) -> usize {
        match &self.state {
            Lifecycle::Unstarted(table) => table.len(),
            Lifecycle::Running(_) => 0,
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Stop accepting and ask open connections to close after their current
    /// request.
    ///
    /// The returned future resolves once every connection is gone, or when
    /// `shutdown_grace` elapses, and yields `true` on a clean drain. It must be
    /// driven for connections on a caller runtime to finish, e.g. with
    /// `block_on` on a current-thread runtime that is about to be dropped.
    pub fn shutdown(&self) -> impl Future<Output = bool> + Send + 'static {
        let tracker = match &self.state {
            Lifecycle::Running(listener) => {
                listener.begin_shutdown();
                Some(listener.tracker())
            }
            Lifecycle::Unstarted(_) => None,
        };
        let grace = self.options.shutdown_grace;

        async move {
            match tracker {
                Some(tracker) => tokio::time::timeout(grace, tracker.wait_idle())
                    .await
                    .is_ok(),
                None => true,
            }
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        let Lifecycle::Running(listener) = &self.state else {
            return;
        };
        let drain = self.shutdown();

        // External runtimes drain on their own; only an owned pool is waited on.
        let Some(ExecutionContext::Owned(pool)) = &self.context else {
            return;
        };

        match pool.block_on(drain) {
            Ok(true) => tracing::info!("All connections closed"),
            Ok(false) => tracing::warn!(
                active = listener.tracker().active(),
                "Shutdown grace period elapsed, abandoning open connections"
            ),
            Err(e) => tracing::warn!(error = %e, "Skipping connection drain"),
        }
    }
}

impl WebServer for HttpServer {
    fn init(&mut self, address: ServerAddress, context: Handle) -> Result<(), ServerError> {
        HttpServer::init(self, address, context)
    }

    fn init_with_threads(
        &mut self,
        address: ServerAddress,
        threads: usize,
    ) -> Result<(), ServerError> {
        HttpServer::init_with_threads(self, address, threads)
    }

    fn add_handler(
        &mut self,
        path: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), ServerError> {
        HttpServer::add_handler(self, path, method, handler)
    }

    fn run(&mut self) -> Result<(), ServerError> {
        HttpServer::run(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        HttpServer::local_addr(self)
    }
}

/// HTTPS server: the plain server plus a TLS overlay applied to every
/// accepted socket before HTTP parsing begins.
pub struct HttpsServer {
    inner: HttpServer,
    tls: Option<TlsContext>,
}

impl Default for HttpsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpsServer {
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        Self {
            inner: HttpServer::with_options(options),
            tls: None,
        }
    }

    pub(crate) fn bound(address: ServerAddress, context: Handle, options: ServerOptions) -> Self {
        Self {
            inner: HttpServer::bound(address, context, options),
            tls: None,
        }
    }

    /// Configure TLS from PEM material.
    ///
    /// `password` is called if the private key is encrypted. Without `dh`
    /// parameters the provider's default key exchange is used.
    pub fn init_ssl(
        &mut self,
        cert: &str,
        key: &str,
        password: Option<PasswordCallback>,
        dh: Option<&str>,
    ) -> Result<(), ServerError> {
        self.inner.ensure_configurable()?;
        if self.tls.is_some() {
            return Err(ServerError::TlsAlreadyConfigured);
        }

        let tls = TlsContext::from_pem(cert, key, password, dh)?;
        tracing::info!(key_agreement = ?tls.key_agreement(), "TLS configured");
        self.tls = Some(tls);
        Ok(())
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        self.inner.ensure_configurable()?;
        let tls = self.tls.as_ref().ok_or(ServerError::TlsNotConfigured)?;
        self.inner.start(Transport::Tls(tls.acceptor()))
    }

    pub fn init(&mut self, address: ServerAddress, context: Handle) -> Result<(), ServerError> {
        self.inner.init(address, context)
    }

    pub fn init_with_threads(
        &mut self,
        address: ServerAddress,
        threads: usize,
    ) -> Result<(), ServerError> {
        self.inner.init_with_threads(address, threads)
    }

    pub fn add_handler(
        &mut self,
        path: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), ServerError> {
        self.inner.add_handler(path, method, handler)
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        self.inner.worker_pool()
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.inner.address()
    }

    pub fn shutdown(&self) -> impl Future<Output = bool> + Send + 'static {
        self.inner.shutdown()
    }

    pub(crate) fn plain(&self) -> &HttpServer {
        &self.inner
    }
}

impl WebServer for HttpsServer {
    fn init(&mut self, address: ServerAddress, context: Handle) -> Result<(), ServerError> {
        HttpsServer::init(self, address, context)
    }

    fn init_with_threads(
        &mut self,
        address: ServerAddress,
        threads: usize,
    ) -> Result<(), ServerError> {
        HttpsServer::init_with_threads(self, address, threads)
    }

    fn add_handler(
        &mut self,
        path: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), ServerError> {
        HttpsServer::add_handler(self, path, method, handler)
    }

    fn run(&mut self) -> Result<(), ServerError> {
        HttpsServer::run(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        HttpsServer::local_addr(self)
    }
}
