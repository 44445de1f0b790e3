//! Routing decision store shared between the control loop and the request path.

use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::route::{RouteKey, RoutingDecision};

/// A concurrent map from route to its current routing decision.
///
/// Backed by a sharded `DashMap`: lookups on different routes never contend with one
/// another, and a write only locks the shard holding that route for the duration of a
/// value copy. Decisions are `Copy` values replaced wholesale, so a reader can never
/// observe a half-updated decision.
///
/// In practice there is a single writer per route (the reconciliation loop), plus the
/// dispatcher seeding defaults for routes it has not seen before. Seeding stops once
/// the store holds `route_limit` routes; explicit puts are never refused.
#[derive(Debug)]
pub struct RoutingDecisionStore {
    decisions: DashMap<RouteKey, RoutingDecision>,
    route_limit: usize,
}

impl Default for RoutingDecisionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingDecisionStore {
    /// Create an empty store that seeds any number of routes.
    pub fn new() -> Self {
        Self::with_route_limit(usize::MAX)
    }

    /// Create an empty store that stops seeding new routes at `route_limit`.
    pub fn with_route_limit(route_limit: usize) -> Self {
        Self {
            decisions: DashMap::new(),
            route_limit,
        }
    }

    /// The current decision for `route`.
    pub fn get(&self, route: &str) -> Option<RoutingDecision> {
        self.decisions.get(route).map(|entry| *entry.value())
    }

    /// Atomically replace the decision for `route`. Last write wins.
    pub fn put(&self, route: RouteKey, decision: RoutingDecision) {
        self.decisions.insert(route, decision);
    }

    /// The current decision for `route`, seeding [`RoutingDecision::seed`] if the route
    /// has never been seen.
    ///
    /// A full store hands out the seed decision without recording it.
    pub fn get_or_seed(&self, route: &str) -> RoutingDecision {
        if let Some(decision) = self.get(route) {
            return decision;
        }
        if self.decisions.len() >= self.route_limit {
            return RoutingDecision::seed();
        }

        *self
            .decisions
            .entry(RouteKey::from(route))
            .or_insert_with(RoutingDecision::seed)
            .value()
    }

    /// Forget `route`, returning its last decision.
    pub fn remove(&self, route: &str) -> Option<RoutingDecision> {
        self.decisions.remove(route).map(|(_, decision)| decision)
    }

    /// Every route that currently has a decision.
    pub fn routes(&self) -> Vec<RouteKey> {
        self.decisions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of routes with a decision.
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// Whether no route has a decision yet.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

/// A shared reference to the decision store.
pub type SharedDecisionStore = Arc<RoutingDecisionStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_after_put_returns_the_same_value() {
        let store = RoutingDecisionStore::new();
        let decision = RoutingDecision::new(0.35, 142.0, 9);

        store.put(RouteKey::from("/orders"), decision);
        assert_eq!(store.get("/orders"), Some(decision));
    }

    #[test]
    fn unknown_route_is_absent_until_seeded() {
        let store = RoutingDecisionStore::new();
        assert!(store.get("/orders").is_none());

        let seeded = store.get_or_seed("/orders");
        assert_eq!(seeded.ratio, 1.0);
        assert_eq!(seeded.request_count, 1);
        assert_eq!(store.get("/orders"), Some(seeded));
    }

    #[test]
    fn seeding_does_not_overwrite_an_existing_decision() {
        let store = RoutingDecisionStore::new();
        let decision = RoutingDecision::new(0.0, 400.0, 0);
        store.put(RouteKey::from("/orders"), decision);

        assert_eq!(store.get_or_seed("/orders"), decision);
    }

    #[test]
    fn concurrent_puts_to_distinct_routes_are_all_kept() {
        let store = Arc::new(RoutingDecisionStore::new());

        thread::scope(|scope| {
            for worker in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..250 {
                        let route = format!("/w{worker}/r{i}");
                        let ratio = (i % 10) as f64 / 10.0;
                        store.put(RouteKey::from(route), RoutingDecision::new(ratio, i as f64, 0));
                    }
                });
            }
        });

        assert_eq!(store.len(), 8 * 250);
        for worker in 0..8 {
            for i in 0..250 {
                let decision = store.get(&format!("/w{worker}/r{i}")).unwrap();
                assert_eq!(decision.latency_avg, i as f64);
                assert_eq!(decision.ratio, (i % 10) as f64 / 10.0);
            }
        }
    }

    #[test]
    fn readers_never_see_a_torn_decision() {
        let store = Arc::new(RoutingDecisionStore::new());
        store.put(RouteKey::from("/orders"), RoutingDecision::new(0.0, 0.0, 0));

        thread::scope(|scope| {
            let writer = &store;
            scope.spawn(move || {
                for i in 0..2_000u64 {
                    // ratio and latency always move together
                    let v = (i % 2) as f64;
                    writer.put(RouteKey::from("/orders"), RoutingDecision::new(v, v, i));
                }
            });

            for _ in 0..4 {
                let reader = &store;
                scope.spawn(move || {
                    for _ in 0..2_000 {
                        let d = reader.get("/orders").unwrap();
                        assert_eq!(d.ratio, d.latency_avg);
                    }
                });
            }
        });
    }

    #[test]
    fn full_store_serves_seed_without_recording_it() {
        let store = RoutingDecisionStore::with_route_limit(2);
        store.get_or_seed("/a");
        store.get_or_seed("/b");

        let overflow = store.get_or_seed("/c");
        assert_eq!(overflow.ratio, 1.0);
        assert!(store.get("/c").is_none());
        assert_eq!(store.len(), 2);

        // the reconciler can still publish decisions past the limit
        store.put(RouteKey::from("/orders"), RoutingDecision::new(0.0, 300.0, 4));
        assert_eq!(store.len(), 3);

        assert!(store.remove("/a").is_some());
        store.get_or_seed("/c");
        assert!(store.get("/c").is_some());
    }

    #[test]
    fn routes_lists_every_key() {
        let store = RoutingDecisionStore::new();
        store.get_or_seed("/a");
        store.get_or_seed("/b");

        let mut routes = store.routes();
        routes.sort();
        assert_eq!(routes, vec![RouteKey::from("/a"), RouteKey::from("/b")]);
    }
}
