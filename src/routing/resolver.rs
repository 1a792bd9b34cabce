//! Longest-prefix route resolution.
//!
//! # Algorithm
//! ```text
//! "/a/b/c" with routes {"a", "a/b"}
//!     exact "/a/b/c"?   no
//!     strip "/" → "a/b/c"? no
//!     truncate → "a/b"?   yes → "a/b"
//! ```
//! Falls back to the catch-all sentinel when nothing matches. Whether the
//! catch-all itself is registered is the caller's concern.

use std::collections::{BTreeSet, HashSet};

use crate::routing::table::{RouteTable, CATCH_ALL};

/// Anything that can answer "is this route registered?".
pub trait KnownRoutes {
    fn contains_route(&self, route: &str) -> bool;
}

impl KnownRoutes for RouteTable {
    fn contains_route(&self, route: &str) -> bool {
        self.contains(route)
    }
}

impl KnownRoutes for HashSet<String> {
    fn contains_route(&self, route: &str) -> bool {
        self.contains(route)
    }
}

impl KnownRoutes for BTreeSet<String> {
    fn contains_route(&self, route: &str) -> bool {
        self.contains(route)
    }
}

impl KnownRoutes for [&str] {
    fn contains_route(&self, route: &str) -> bool {
        self.iter().any(|known| *known == route)
    }
}

/// Resolve a request path to the best registered route, or [`CATCH_ALL`].
pub fn resolve<'a, R>(routes: &R, path: &'a str) -> &'a str
where
    R: KnownRoutes + ?Sized,
{
    if !path.is_empty() && routes.contains_route(path) {
        return path;
    }

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return CATCH_ALL;
    }
    if routes.contains_route(trimmed) {
        return trimmed;
    }

    let mut candidate = trimmed;
    while let Some(idx) = candidate.rfind('/') {
        candidate = &candidate[..idx];
        if !candidate.is_empty() && routes.contains_route(candidate) {
            return candidate;
        }
    }

    CATCH_ALL
}
