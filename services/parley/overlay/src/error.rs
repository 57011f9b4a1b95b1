//! Overlay node errors

use std::net::SocketAddr;
use thiserror::Error;

/// Errors starting or running an overlay node
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Node configuration rejected
    #[error("invalid node configuration: {0}")]
    Config(String),

    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Listener failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
