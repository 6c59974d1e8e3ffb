//! Bind targets.
//!
//! A [`ServerAddress`] is an opaque host/port pair handed to a server at
//! initialization. It is not resolved or validated until the listener binds.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ServerError;

/// Host and port a server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the socket addresses to try when binding.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, ServerError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let addrs: Vec<SocketAddr> = (host, self.port)
            .to_socket_addrs()
            .map_err(|e| self.invalid(e.to_string()))?
            .collect();

        if addrs.is_empty() {
            return Err(self.invalid("host resolved to no addresses"));
        }
        Ok(addrs)
    }

    fn invalid(&self, reason: impl Into<String>) -> ServerError {
        ServerError::InvalidAddress {
            address: self.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for ServerAddress {
    type Err = ServerError;

    /// Parses `host:port`, with IPv6 hosts in brackets (`[::1]:8080`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ServerError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '[' in IPv6 host"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        Ok(Self::new(host, port))
    }
}
