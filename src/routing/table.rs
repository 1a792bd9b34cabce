//! Live route table.
//!
//! # Responsibilities
//! - Track which route prefixes currently have registered connector sockets
//! - Count registrations so a route disappears only with its last socket
//!
//! Shared by the v1 and v3 pools, so a route stays known while either
//! protocol still has a socket for it.

use dashmap::DashMap;

/// Route name used by connectors that serve every unmatched path.
pub const CATCH_ALL: &str = "*";

/// Concurrent set of known routes with per-route registration counts.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, usize>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more registered socket for `route`.
    pub fn add(&self, route: &str) {
        *self.routes.entry(route.to_string()).or_insert(0) += 1;
    }

    /// Record that one socket for `route` is gone.
    ///
    /// Returns true when this was the last socket and the route was removed.
    pub fn release(&self, route: &str) -> bool {
        self.routes
            .remove_if_mut(route, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            })
            .is_some()
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Number of sockets (idle or borrowed, any protocol) registered for `route`.
    pub fn registrations(&self, route: &str) -> usize {
        self.routes.get(route).map(|c| *c).unwrap_or(0)
    }

    /// Sorted snapshot of the known routes.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
