//! Listen address parsing and the address advertised for it.

use crate::error::ServerError;
use std::fmt;
use std::net::SocketAddr;

/// A configured listen address.
///
/// Accepts `:port` (all interfaces), `ip:port` and `host:port`. The
/// advertised form replaces an unspecified host with `localhost`, so
/// `:9090`, `0.0.0.0:9090` and `[::]:9090` are advertised as
/// `localhost:9090`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenAddr {
    bind: String,
    host: String,
    port: u16,
}

impl ListenAddr {
    /// Parse a configured address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidAddress`] for empty input, a missing or
    /// non-numeric port, or a host containing whitespace.
    pub fn parse(addr: &str) -> Result<Self, ServerError> {
        let invalid = |reason: &str| ServerError::InvalidAddress {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = addr.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }

        if let Some(port) = trimmed.strip_prefix(':') {
            let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
            return Ok(Self {
                bind: format!("0.0.0.0:{port}"),
                host: "localhost".to_string(),
                port,
            });
        }

        if let Ok(socket) = trimmed.parse::<SocketAddr>() {
            let host = if socket.ip().is_unspecified() {
                "localhost".to_string()
            } else {
                match socket {
                    SocketAddr::V4(v4) => v4.ip().to_string(),
                    SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
                }
            };
            let bind = if socket.ip().is_unspecified() && socket.is_ipv4() {
                format!("0.0.0.0:{}", socket.port())
            } else {
                socket.to_string()
            };
            return Ok(Self {
                bind,
                host,
                port: socket.port(),
            });
        }

        let (host, port) = trimmed.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid("bad host"));
        }
        Ok(Self {
            bind: trimmed.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Address handed to the socket bind call.
    pub fn bind_addr(&self) -> &str {
        &self.bind
    }

    /// Configured port; 0 asks the OS for one.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address written to the discovery record once bound to `local`.
    /// A configured port of 0 is replaced by the port the OS picked.
    pub fn advertised(&self, local: SocketAddr) -> String {
        let port = if self.port == 0 { local.port() } else { self.port };
        format!("{}:{}", self.host, port)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bind)
    }
}
