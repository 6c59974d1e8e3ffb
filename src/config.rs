//! Configuration loading and constants.
//!
//! [`ServerOptions`] holds the tunables the library applies to every server
//! it builds. [`AppConfig`] is the TOML document read by the `hearth` binary;
//! it maps onto a [`ServerAddress`], an execution context choice, TLS file
//! paths and a [`ServerOptions`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use const_format::formatcp;
use serde::Deserialize;

use crate::address::ServerAddress;

// =============================================================================
// Connection Limits and Timeouts
// =============================================================================

/// Time allowed for in-flight connections to finish when a server is dropped
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Time allowed for a client to complete the TLS handshake
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Time allowed for a client to send complete request headers
pub const DEFAULT_HEADER_READ_TIMEOUT_SECS: u64 = 30;

/// Largest request body read before answering 413 (2 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Pause after accept fails for lack of file descriptors or memory
pub const ACCEPT_ERROR_BACKOFF_MS: u64 = 100;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default bind host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default bind port
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address, `host:port`
pub const DEFAULT_BIND: &str = formatcp!("{}:{}", DEFAULT_HOST, DEFAULT_PORT);

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "hearth=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Runtime tunables applied by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub shutdown_grace: Duration,
    pub tls_handshake_timeout: Duration,
    pub header_read_timeout: Duration,
    pub max_body_bytes: usize,
    pub keep_alive: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            tls_handshake_timeout: Duration::from_secs(DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS),
            header_read_timeout: Duration::from_secs(DEFAULT_HEADER_READ_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            keep_alive: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listener configuration
    pub http: HttpConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpConfig::default_port")]
    pub port: u16,
    /// Size of the server-owned worker pool. When absent the binary drives
    /// the server from its own runtime instead.
    pub worker_threads: Option<usize>,
    #[serde(default = "HttpConfig::default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "HttpConfig::default_header_read_timeout")]
    pub header_read_timeout_seconds: u64,
    #[serde(default = "HttpConfig::default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "HttpConfig::default_keep_alive")]
    pub keep_alive: bool,
    #[serde(default)]
    pub tls: TlsFileConfig,
}

impl HttpConfig {
    fn default_host() -> String {
        DEFAULT_HOST.to_string()
    }

    fn default_port() -> u16 {
        DEFAULT_PORT
    }

    fn default_shutdown_grace() -> u64 {
        DEFAULT_SHUTDOWN_GRACE_SECS
    }

    fn default_header_read_timeout() -> u64 {
        DEFAULT_HEADER_READ_TIMEOUT_SECS
    }

    fn default_max_body_bytes() -> usize {
        DEFAULT_MAX_BODY_BYTES
    }

    fn default_keep_alive() -> bool {
        true
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            tls_handshake_timeout: Duration::from_secs(self.tls.handshake_timeout_seconds),
            header_read_timeout: Duration::from_secs(self.header_read_timeout_seconds),
            max_body_bytes: self.max_body_bytes,
            keep_alive: self.keep_alive,
        }
    }
}

/// TLS material locations
#[derive(Debug, Clone, Deserialize)]
pub struct TlsFileConfig {
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// PEM private key, optionally an encrypted PKCS#8 block
    pub key_path: Option<PathBuf>,
    /// Password for an encrypted private key
    pub key_password: Option<String>,
    /// PEM DH parameters
    pub dh_params_path: Option<PathBuf>,
    #[serde(default = "TlsFileConfig::default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

impl Default for TlsFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            key_password: None,
            dh_params_path: None,
            handshake_timeout_seconds: Self::default_handshake_timeout(),
        }
    }
}

impl TlsFileConfig {
    fn default_handshake_timeout() -> u64 {
        DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.worker_threads == Some(0) {
            return Err(ConfigError::Validation(
                "http.worker_threads must be at least 1".to_string(),
            ));
        }

        let tls = &self.http.tls;
        if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
            return Err(ConfigError::Validation(
                "http.tls.enabled requires both cert_path and key_path".to_string(),
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "logging.format must be \"text\" or \"json\", got \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
