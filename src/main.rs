//! Hearth: a small HTTP/HTTPS server built on the hearth library.
//!
//! Loads configuration from TOML, initializes tracing, builds a plain or
//! secure server, registers a few built-in handlers and serves until SIGINT
//! or SIGTERM. Dropping the server at the end drains open connections.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::CONTENT_TYPE;
use http::{Method, StatusCode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hearth::config::{AppConfig, TlsFileConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use hearth::{
    Handler, HttpServer, HttpsServer, PasswordCallback, Response, Server, ServerFactory,
    ServerKind, WebServer,
};

/// Hearth: an embeddable HTTP/HTTPS server
#[derive(Parser, Debug)]
#[command(name = "hearth", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "hearth=debug")
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter, &config.logging.format);

    tracing::info!(path = %args.config, "Loaded configuration");

    let kind = if config.http.tls.enabled {
        ServerKind::Secure
    } else {
        ServerKind::Plain
    };
    let options = config.http.server_options();
    let address = config.http.address();

    // Drives signal handling, and the server too when no worker pool is configured.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let mut server = match config.http.worker_threads {
        Some(threads) => {
            let mut server = match kind {
                ServerKind::Plain => Server::Plain(HttpServer::with_options(options)),
                ServerKind::Secure => Server::Secure(HttpsServer::with_options(options)),
            };
            server.init_with_threads(address, threads)?;
            tracing::info!(threads, "Using owned worker pool");
            server
        }
        None => {
            tracing::info!("Using caller runtime");
            ServerFactory::new(options).create(kind, address, runtime.handle().clone())
        }
    };

    if let Some(secure) = server.secure_mut() {
        configure_tls(secure, &config.http.tls)?;
    }

    register_handlers(&mut server)?;
    server.run()?;

    if let Some(addr) = server.local_addr() {
        let scheme = match kind {
            ServerKind::Plain => "http",
            ServerKind::Secure => "https",
        };
        tracing::info!("Serving at {}://{}", scheme, addr);
    }

    let signal = runtime.block_on(hearth::shutdown::wait_for_signal())?;
    tracing::info!(?signal, "Stopping server");

    // Connections served on `runtime` only finish while it is being driven.
    let drain = server.shutdown();
    drop(server);
    if runtime.block_on(drain) {
        tracing::info!("Shutdown complete");
    } else {
        tracing::warn!("Shutdown grace period elapsed with connections still open");
    }

    Ok(())
}

fn init_tracing(filter: &str, format: &str) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(filter));

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn configure_tls(
    server: &mut HttpsServer,
    tls: &TlsFileConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) else {
        return Err("TLS enabled without cert_path and key_path".into());
    };

    let cert = read_pem(cert_path)?;
    let key = read_pem(key_path)?;
    let dh = tls.dh_params_path.as_deref().map(read_pem).transpose()?;
    let password = tls.key_password.clone().map(|password| {
        let callback: PasswordCallback = Arc::new(move || password.clone());
        callback
    });

    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        dh = dh.is_some(),
        "Loading TLS material"
    );
    server.init_ssl(&cert, &key, password, dh.as_deref())?;
    Ok(())
}

fn read_pem(path: &Path) -> Result<String, std::io::Error> {
    fs::read_to_string(path).map_err(|e| {
        std::io::Error::new(e.kind(), format!("Failed to read {}: {}", path.display(), e))
    })
}

fn register_handlers(server: &mut Server) -> Result<(), hearth::ServerError> {
    // Liveness probe
    server.add_handler(
        "/health",
        Method::GET,
        Handler::new(|_req, res| res.text(StatusCode::OK, "ok")),
    )?;

    server.add_handler(
        "/echo",
        Method::POST,
        Handler::new(|req, res| {
            let content_type = req.headers().get(CONTENT_TYPE).cloned();
            let mut response = Response::new(req.into_body());
            if let Some(content_type) = content_type {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            res.send(response);
        }),
    )?;

    // Everything else under "/" falls back here by prefix.
    server.add_handler(
        "/",
        Method::GET,
        Handler::new(|req, res| {
            if req.uri().path() == "/" {
                res.text(
                    StatusCode::OK,
                    Bytes::from_static(concat!("hearth ", env!("CARGO_PKG_VERSION"), "\n").as_bytes()),
                );
            } else {
                res.text(StatusCode::NOT_FOUND, "Not Found");
            }
        }),
    )?;

    Ok(())
}
