use std::io;

/// Errors surfaced synchronously by server configuration and startup.
///
/// Per-connection and handler failures never show up here; the listener
/// contains them and answers the affected client instead.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Execution context already initialized")]
    AlreadyInitialized,

    #[error("No execution context configured")]
    NoExecutionContext,

    #[error("Thread pool size must be at least 1")]
    InvalidThreadCount,

    #[error("Invalid server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start worker pool: {0}")]
    Runtime(#[source] io::Error),

    #[error("Failed to load TLS configuration: {0}")]
    Tls(String),

    #[error("TLS already configured")]
    TlsAlreadyConfigured,

    #[error("TLS not configured; call init_ssl before run")]
    TlsNotConfigured,
}

/// Error signalled by a handler instead of a response.
///
/// The client sees a generic `500 Internal Server Error`; the message is only logged.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<io::Error> for HandlerError {
    fn from(e: io::Error) -> Self {
        Self(e.to_string())
    }
}
