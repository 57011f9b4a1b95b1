//! Error types surfaced by the session layer.

use parley_naming::NameError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by connection setup, sessions and the request/reply loops
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A configured identity did not parse
    #[error("invalid name format: {0}")]
    InvalidNameFormat(#[from] NameError),

    /// Shared secret is too short to authorise with
    #[error("shared secret must be at least {min} characters")]
    InvalidSecret {
        /// Minimum accepted length
        min: usize,
    },

    /// Connecting or authorising against the overlay failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Registering an identity for inbound delivery failed
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Binding a remote name to a connection failed
    #[error("routing error: {0}")]
    Routing(String),

    /// Session request was rejected, timed out or lost its connection
    #[error("session establish error: {0}")]
    SessionEstablish(String),

    /// Listening for inbound sessions failed
    #[error("listen error: {0}")]
    Listen(String),

    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Publishing a message failed
    #[error("send error: {0}")]
    Send(String),

    /// Receiving or opening a message failed
    #[error("receive error: {0}")]
    Receive(String),

    /// The session was torn down by the peer or lost its connection
    #[error("session closed")]
    SessionClosed,
}

impl SessionError {
    /// Errors that abort process setup rather than a single exchange
    pub fn is_setup_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidNameFormat(_)
                | SessionError::InvalidSecret { .. }
                | SessionError::Connection(_)
                | SessionError::Subscription(_)
                | SessionError::Routing(_)
        )
    }
}
