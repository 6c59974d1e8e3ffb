//! Accept loop and per-connection request handling.
//!
//! A [`Listener`] owns one bound socket. Each accepted connection is served
//! on its own task, optionally behind a TLS handshake, and every request on it
//! is resolved against the frozen handler table, then its body is read in full.
//!
//! Failures are contained here: accept errors are logged and the loop keeps
//! going, and a failed handshake or malformed request only closes that
//! connection. Handler panics and errors become `500` responses.

use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use uuid::Uuid;

use crate::address::ServerAddress;
use crate::config::{ServerOptions, ACCEPT_ERROR_BACKOFF_MS};
use crate::error::ServerError;
use crate::handler::{FrozenHandlers, Request, Responder};

/// Response type written back to the client.
pub type HttpResponse = hyper::Response<Full<Bytes>>;

/// Byte-level framing used on accepted sockets.
#[derive(Clone)]
pub(crate) enum Transport {
    Plain,
    Tls(TlsAcceptor),
}

impl Transport {
    fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

/// A socket that is bound and registered with a runtime but not yet accepting.
pub(crate) struct BoundSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Bind `address` on the runtime behind `handle`.
///
/// Nothing is spawned yet, so a failure here leaves no background state.
pub(crate) fn bind(address: &ServerAddress, handle: &Handle) -> Result<BoundSocket, ServerError> {
    let bind_error = |source| ServerError::Bind {
        address: address.to_string(),
        source,
    };

    let addrs = address.resolve()?;
    let socket = std::net::TcpListener::bind(&addrs[..]).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    let local_addr = socket.local_addr().map_err(bind_error)?;

    let _guard = handle.enter();
    let listener = TcpListener::from_std(socket).map_err(bind_error)?;

    Ok(BoundSocket {
        listener,
        local_addr,
    })
}

impl BoundSocket {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop.
    pub(crate) fn start(
        self,
        handle: &Handle,
        handlers: Arc<FrozenHandlers>,
        transport: Transport,
        options: ServerOptions,
    ) -> Listener {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = ConnectionTracker::default();

        tracing::info!(
            addr = %self.local_addr,
            tls = transport.is_tls(),
            handlers = handlers.len(),
            "Listening"
        );

        let service = Arc::new(ConnectionService {
            handlers,
            transport,
            options,
        });
        handle.spawn(accept_loop(
            self.listener,
            service,
            tracker.clone(),
            shutdown_rx,
        ));

        Listener {
            local_addr: self.local_addr,
            shutdown: shutdown_tx,
            tracker,
        }
    }
}

/// Live accept loop for one address. Dropping it stops accepting and asks
/// open connections to close after their current request.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tracker: ConnectionTracker,
}

impl Listener {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    pub(crate) fn begin_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!(
                addr = %self.local_addr,
                active = self.tracker.active(),
                "Listener shutting down"
            );
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.begin_shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<ConnectionService>,
    tracker: ConnectionTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&service);
                        let guard = tracker.acquire();
                        let shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            service.serve(stream, peer, shutdown).await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        if is_resource_exhaustion(&e) {
                            tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS)).await;
                        }
                    }
                }
            }

            _ = shutdown.changed() => {
                break;
            }
        }
    }

    tracing::debug!("Accept loop stopped");
}

fn is_resource_exhaustion(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    if matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    ) {
        return true;
    }
    e.kind() == std::io::ErrorKind::OutOfMemory
}

struct ConnectionService {
    handlers: Arc<FrozenHandlers>,
    transport: Transport,
    options: ServerOptions,
}

impl ConnectionService {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        match &self.transport {
            Transport::Plain => self.serve_http(stream, peer, shutdown).await,
            Transport::Tls(acceptor) => {
                let handshake = tokio::time::timeout(
                    self.options.tls_handshake_timeout,
                    acceptor.accept(stream),
                );
                match handshake.await {
                    Ok(Ok(tls)) => self.serve_http(tls, peer, shutdown).await,
                    Ok(Err(e)) => {
                        tracing::warn!(%peer, error = %e, "TLS handshake failed");
                    }
                    Err(_) => {
                        tracing::warn!(%peer, "TLS handshake timed out");
                    }
                }
            }
        }
    }

    async fn serve_http<S>(&self, stream: S, peer: SocketAddr, mut shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handlers = Arc::clone(&self.handlers);
        let max_body_bytes = self.options.max_body_bytes;
        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let handlers = Arc::clone(&handlers);
            async move { Ok::<_, Infallible>(dispatch(&handlers, req, max_body_bytes).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .keep_alive(self.options.keep_alive)
            .timer(TokioTimer::new())
            .header_read_timeout(self.options.header_read_timeout);

        let conn = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.changed() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };

        if let Err(e) = result {
            tracing::debug!(%peer, error = %e, "Connection closed with error");
        }
    }
}

/// Read the request, resolve its handler and produce the response.
async fn dispatch(
    handlers: &FrozenHandlers,
    req: hyper::Request<Incoming>,
    max_body_bytes: usize,
) -> HttpResponse {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
        duration_ms = tracing::field::Empty,
    );

    let start = Instant::now();

    async move {
        let response = route(handlers, req, max_body_bytes).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::info!(
            status = response.status().as_u16(),
            duration_ms,
            "Request completed"
        );

        response
    }
    .instrument(span)
    .await
}

async fn route(
    handlers: &FrozenHandlers,
    req: hyper::Request<Incoming>,
    max_body_bytes: usize,
) -> HttpResponse {
    let (parts, body) = req.into_parts();

    let Some(handler) = handlers.resolve(parts.uri.path(), &parts.method) else {
        return status_response(StatusCode::NOT_FOUND);
    };

    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            tracing::warn!(limit = max_body_bytes, "Request body too large");
            return status_response(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read request body");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let request = Request::from_parts(parts, body);
    let (responder, outcome) = Responder::channel();

    let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(request, responder)));
    if let Err(panic) = invoked {
        tracing::error!(panic = panic_message(&panic), "Handler panicked");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    }

    match outcome.await {
        Ok(Ok(response)) => response.map(Full::new),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Handler failed");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => {
            tracing::error!("Handler finished without responding");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn status_response(status: StatusCode) -> HttpResponse {
    let reason = status.canonical_reason().unwrap_or("");
    let mut response = hyper::Response::new(Full::new(Bytes::from_static(reason.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Counts live connections so shutdown can wait for them to finish.
#[derive(Clone, Default)]
pub(crate) struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    pub(crate) fn acquire(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves once no connections remain.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
