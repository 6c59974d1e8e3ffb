//! Handler registration and lookup.
//!
//! Handlers are collected in a [`HandlerTable`] while the server is being
//! configured. Starting the server calls [`HandlerTable::freeze`], which
//! consumes the table and yields a [`FrozenHandlers`] view. The frozen view has
//! no mutating methods and no interior mutability, so connection tasks share it
//! through an `Arc` and read it without locking.
//!
//! Lookup policy:
//! 1. exact path match with the request method;
//! 2. otherwise the longest registered path that is a string prefix of the
//!    request path and has a handler for the request method.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, StatusCode};
use tokio::sync::oneshot;

use crate::error::HandlerError;

/// A fully read request: method, URI, headers and collected body.
pub type Request = http::Request<Bytes>;

/// The response a handler produces.
pub type Response = http::Response<Bytes>;

pub(crate) type Outcome = Result<Response, HandlerError>;

/// Caller-supplied callback invoked for a matched request.
///
/// The callback receives the request and a [`Responder`]. It may answer
/// inline or move the responder into a spawned task and answer later.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Request, Responder) + Send + Sync>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Request, Responder) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, request: Request, responder: Responder) {
        (self.0)(request, responder)
    }

    /// True if both handles refer to the same registered callback.
    pub fn ptr_eq(a: &Handler, b: &Handler) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&Arc::as_ptr(&self.0)).finish()
    }
}

/// Write side of a single request.
///
/// Consuming `self` on every terminal method means a handler answers at most
/// once. Dropping the responder without answering is reported to the client
/// as a server error.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Outcome>,
}

impl Responder {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send the final response.
    pub fn send(self, response: Response) {
        // The connection may already be gone; nothing to do then.
        let _ = self.tx.send(Ok(response));
    }

    /// Send a plain-text response with the given status.
    pub fn text(self, status: StatusCode, body: impl Into<Bytes>) {
        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.send(response);
    }

    /// Signal that the request could not be handled.
    pub fn fail(self, error: HandlerError) {
        let _ = self.tx.send(Err(error));
    }
}

type MethodMap = HashMap<Method, Handler>;

/// Mutable handler registry used during configuration.
#[derive(Debug, Default)]
pub struct HandlerTable {
    entries: HashMap<String, MethodMap>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler; a later registration for the same path and method wins.
    pub fn register(&mut self, path: impl Into<String>, method: Method, handler: Handler) {
        self.entries
            .entry(path.into())
            .or_default()
            .insert(method, handler);
    }

    /// Number of (path, method) registrations.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End the configuration phase, producing the read-only lookup view.
    pub fn freeze(self) -> FrozenHandlers {
        let mut by_length: Vec<String> = self.entries.keys().cloned().collect();
        by_length.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        FrozenHandlers {
            entries: self.entries,
            by_length,
        }
    }
}

/// Read-only handler lookup shared by all connection tasks.
#[derive(Debug)]
pub struct FrozenHandlers {
    entries: HashMap<String, MethodMap>,
    /// Registered paths, longest first.
    by_length: Vec<String>,
}

impl FrozenHandlers {
    /// Find the handler for a request path and method.
    pub fn resolve(&self, path: &str, method: &Method) -> Option<&Handler> {
        if let Some(handler) = self.entries.get(path).and_then(|m| m.get(method)) {
            return Some(handler);
        }

        self.by_length
            .iter()
            .filter(|prefix| path.starts_with(prefix.as_str()))
            .find_map(|prefix| self.entries.get(prefix).and_then(|m| m.get(method)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
