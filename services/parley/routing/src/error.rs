//! Routing error types.

use crate::router::ConnectionId;
use parley_naming::Name;
use thiserror::Error;

/// Routing table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Name is already held by another connection
    #[error("{name} is already subscribed on {holder}")]
    AlreadySubscribed {
        /// Contested name
        name: Name,
        /// Connection currently holding the name
        holder: ConnectionId,
    },
}
