//! TCP transport and server endpoint parsing.

use crate::error::SessionError;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Schemes accepted in front of `host:port` and otherwise ignored
const ACCEPTED_SCHEMES: [&str; 2] = ["tcp", "http"];

/// Server endpoint as `host` and `port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Parse `host:port`, `tcp://host:port` or `http://host:port`
    pub fn parse(server: &str) -> Result<Self, SessionError> {
        let trimmed = server.trim();
        let authority = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                if !ACCEPTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
                    return Err(SessionError::Connection(format!(
                        "unsupported scheme '{}' in {}",
                        scheme, server
                    )));
                }
                rest
            }
            None => trimmed,
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            SessionError::Connection(format!("missing port in server endpoint {}", server))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(SessionError::Connection(format!(
                "missing host in server endpoint {}",
                server
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            SessionError::Connection(format!("invalid port in server endpoint {}", server))
        })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to an endpoint, resolving its host name
pub async fn connect_tcp(endpoint: &Endpoint) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
