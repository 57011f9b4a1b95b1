//! Router trait and routing decision logic

use async_trait::async_trait;
use parley_naming::Name;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to one transport link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Routing decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Forward over the given connection
    Forward(ConnectionId),
    /// Drop the frame
    Drop(DropReason),
}

/// Reason for dropping a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Nobody is subscribed under the destination name
    NoRoute,
    /// TTL expired
    TtlExpired,
    /// Destination would loop back to the sender
    RoutingLoop,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoRoute => write!(f, "no route"),
            DropReason::TtlExpired => write!(f, "ttl expired"),
            DropReason::RoutingLoop => write!(f, "routing loop"),
        }
    }
}

/// Routing context for making routing decisions
#[derive(Debug, Clone)]
pub struct RoutingContext {
    /// Connection the frame arrived on
    pub ingress: ConnectionId,
    /// Destination name
    pub dst: Name,
    /// Current TTL value
    pub ttl: u8,
}

impl RoutingContext {
    /// Create a new routing context
    pub fn new(ingress: ConnectionId, dst: Name, ttl: u8) -> Self {
        Self { ingress, dst, ttl }
    }

    /// A frame can only be forwarded while one more hop fits in its TTL
    pub fn is_ttl_expired(&self) -> bool {
        self.ttl <= 1
    }
}

/// Router trait for making routing decisions
#[async_trait]
pub trait Router: Send + Sync {
    /// Make a routing decision for the given context
    async fn decide(&self, ctx: &RoutingContext) -> RoutingDecision;

    /// Check if a destination is reachable
    async fn is_reachable(&self, dst: &Name) -> bool;

    /// Get routing statistics
    async fn get_stats(&self) -> RouterStats;
}

/// Router statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Total number of routes
    pub total_routes: usize,
    /// Number of routing decisions made
    pub decisions_made: u64,
    /// Number of frames forwarded
    pub packets_forwarded: u64,
    /// Number of frames dropped
    pub packets_dropped: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: std::collections::HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_context_ttl() {
        let dst = Name::parse("org/alice/v1").unwrap();
        let ctx = RoutingContext::new(ConnectionId(1), dst.clone(), 16);
        assert!(!ctx.is_ttl_expired());

        let ctx = RoutingContext::new(ConnectionId(1), dst, 1);
        assert!(ctx.is_ttl_expired());
    }

    #[test]
    fn test_drop_reason_display() {
        assert_eq!(DropReason::NoRoute.to_string(), "no route");
        assert_eq!(DropReason::TtlExpired.to_string(), "ttl expired");
        assert_eq!(DropReason::RoutingLoop.to_string(), "routing loop");
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
        assert_eq!(ConnectionId(7).get(), 7);
    }
}
