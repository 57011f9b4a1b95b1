//! Route and subscription tables

use crate::error::RoutingError;
use crate::router::{ConnectionId, DropReason, Router, RouterStats, RoutingContext, RoutingDecision};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_naming::Name;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Client-side table binding remote names to the connection that reaches them
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<Name, ConnectionId>,
}

impl RouteTable {
    /// Create an empty route table
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `remote` to `conn`, returning the previous binding if it differed
    pub fn set_route(&self, remote: Name, conn: ConnectionId) -> Option<ConnectionId> {
        let previous = self.routes.insert(remote.clone(), conn);
        match previous {
            Some(old) if old == conn => None,
            Some(old) => {
                debug!(component = "routing", remote = %remote, from = %old, to = %conn, "route re-bound");
                Some(old)
            }
            None => {
                debug!(component = "routing", remote = %remote, conn = %conn, "route added");
                None
            }
        }
    }

    /// Connection bound to `remote`, if any
    pub fn route_for(&self, remote: &Name) -> Option<ConnectionId> {
        self.routes.get(remote).map(|entry| *entry.value())
    }

    /// All routes
    pub fn routes(&self) -> Vec<(Name, ConnectionId)> {
        self.routes
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Table binding subscribed names to the connection they were claimed on
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscriptions: DashMap<Name, ConnectionId>,
    stats: Arc<RwLock<RouterStats>>,
    decisions_counter: AtomicU64,
    forwards_counter: AtomicU64,
    drops_counter: AtomicU64,
}

impl SubscriptionTable {
    /// Create an empty subscription table
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `conn`; idempotent on the same connection
    pub fn subscribe(&self, name: Name, conn: ConnectionId) -> Result<(), RoutingError> {
        match self.subscriptions.entry(name) {
            Entry::Occupied(entry) => {
                let holder = *entry.get();
                if holder == conn {
                    Ok(())
                } else {
                    Err(RoutingError::AlreadySubscribed {
                        name: entry.key().clone(),
                        holder,
                    })
                }
            }
            Entry::Vacant(entry) => {
                debug!(component = "routing", name = %entry.key(), conn = %conn, "subscribed");
                entry.insert(conn);
                Ok(())
            }
        }
    }

    /// Release `name` if `conn` holds it
    pub fn unsubscribe(&self, name: &Name, conn: ConnectionId) -> bool {
        self.subscriptions
            .remove_if(name, |_, holder| *holder == conn)
            .is_some()
    }

    /// Release every name held by `conn`, returning them
    pub fn unsubscribe_connection(&self, conn: ConnectionId) -> Vec<Name> {
        let names: Vec<Name> = self
            .subscriptions
            .iter()
            .filter(|entry| *entry.value() == conn)
            .map(|entry| entry.key().clone())
            .collect();

        for name in &names {
            self.subscriptions.remove_if(name, |_, holder| *holder == conn);
        }

        if !names.is_empty() {
            debug!(component = "routing", conn = %conn, released = names.len(), "subscriptions withdrawn");
        }
        names
    }

    /// Connection holding `name`
    pub fn holder_of(&self, name: &Name) -> Option<ConnectionId> {
        self.subscriptions.get(name).map(|entry| *entry.value())
    }

    /// Names held by `conn`
    pub fn names_on(&self, conn: ConnectionId) -> Vec<Name> {
        self.subscriptions
            .iter()
            .filter(|entry| *entry.value() == conn)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of subscribed names
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no name is subscribed
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    async fn update_stats(&self, decision: &RoutingDecision) {
        self.decisions_counter.fetch_add(1, Ordering::Relaxed);

        match decision {
            RoutingDecision::Forward(_) => {
                self.forwards_counter.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Drop(reason) => {
                self.drops_counter.fetch_add(1, Ordering::Relaxed);

                let mut stats = self.stats.write().await;
                *stats.drop_reasons.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
    }
}

#[async_trait]
impl Router for SubscriptionTable {
    async fn decide(&self, ctx: &RoutingContext) -> RoutingDecision {
        let decision = if ctx.is_ttl_expired() {
            RoutingDecision::Drop(DropReason::TtlExpired)
        } else {
            match self.holder_of(&ctx.dst) {
                Some(conn) if conn == ctx.ingress => RoutingDecision::Drop(DropReason::RoutingLoop),
                Some(conn) => RoutingDecision::Forward(conn),
                None => RoutingDecision::Drop(DropReason::NoRoute),
            }
        };

        debug!(
            component = "routing",
            dst = %ctx.dst,
            ingress = %ctx.ingress,
            ttl = ctx.ttl,
            ?decision,
            "routing decision"
        );
        self.update_stats(&decision).await;
        decision
    }

    async fn is_reachable(&self, dst: &Name) -> bool {
        self.subscriptions.contains_key(dst)
    }

    async fn get_stats(&self) -> RouterStats {
        let mut stats = self.stats.write().await;

        stats.decisions_made = self.decisions_counter.load(Ordering::Relaxed);
        stats.packets_forwarded = self.forwards_counter.load(Ordering::Relaxed);
        stats.packets_dropped = self.drops_counter.load(Ordering::Relaxed);
        stats.total_routes = self.subscriptions.len();

        stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    #[test]
    fn test_route_table_set_and_rebind() {
        let table = RouteTable::new();
        let alice = name("org/alice/v1");

        assert_eq!(table.route_for(&alice), None);
        assert_eq!(table.set_route(alice.clone(), ConnectionId(1)), None);
        assert_eq!(table.set_route(alice.clone(), ConnectionId(1)), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.route_for(&alice), Some(ConnectionId(1)));

        assert_eq!(
            table.set_route(alice.clone(), ConnectionId(2)),
            Some(ConnectionId(1))
        );
        assert_eq!(table.route_for(&alice), Some(ConnectionId(2)));
        assert_eq!(table.routes(), vec![(alice, ConnectionId(2))]);
    }

    #[test]
    fn test_subscribe_conflict_and_release() {
        let table = SubscriptionTable::new();
        let alice = name("org/alice/v1");

        table.subscribe(alice.clone(), ConnectionId(1)).unwrap();
        table.subscribe(alice.clone(), ConnectionId(1)).unwrap();

        let err = table.subscribe(alice.clone(), ConnectionId(2)).unwrap_err();
        assert_eq!(
            err,
            RoutingError::AlreadySubscribed {
                name: alice.clone(),
                holder: ConnectionId(1)
            }
        );

        assert!(!table.unsubscribe(&alice, ConnectionId(2)));
        assert_eq!(table.names_on(ConnectionId(1)), vec![alice.clone()]);
        assert_eq!(table.unsubscribe_connection(ConnectionId(1)), vec![alice.clone()]);
        assert!(table.is_empty());

        table.subscribe(alice, ConnectionId(2)).unwrap();
    }

    #[tokio::test]
    async fn test_router_decisions() {
        let table = SubscriptionTable::new();
        let alice = name("org/alice/v1");
        let bob = name("org/bob/v1");
        table.subscribe(alice.clone(), ConnectionId(1)).unwrap();
        table.subscribe(bob.clone(), ConnectionId(2)).unwrap();

        let forward = table
            .decide(&RoutingContext::new(ConnectionId(2), alice.clone(), 16))
            .await;
        assert_eq!(forward, RoutingDecision::Forward(ConnectionId(1)));

        let missing = table
            .decide(&RoutingContext::new(ConnectionId(2), name("org/carol/v1"), 16))
            .await;
        assert_eq!(missing, RoutingDecision::Drop(DropReason::NoRoute));

        let expired = table
            .decide(&RoutingContext::new(ConnectionId(2), alice.clone(), 1))
            .await;
        assert_eq!(expired, RoutingDecision::Drop(DropReason::TtlExpired));

        let looped = table
            .decide(&RoutingContext::new(ConnectionId(1), alice.clone(), 16))
            .await;
        assert_eq!(looped, RoutingDecision::Drop(DropReason::RoutingLoop));

        assert!(table.is_reachable(&bob).await);

        let stats = table.get_stats().await;
        assert_eq!(stats.decisions_made, 4);
        assert_eq!(stats.packets_forwarded, 1);
        assert_eq!(stats.packets_dropped, 3);
        assert_eq!(stats.total_routes, 2);
        assert_eq!(stats.drop_reasons.get("no route"), Some(&1));
    }
}
