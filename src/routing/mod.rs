//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Connector registers (route "svc")   → table.rs (refcount route += 1)
//! Connector socket removed            → table.rs (refcount -= 1, drop at 0)
//!
//! Incoming request path "/svc/api/x"
//!     → resolver.rs (exact match, then longest prefix, then "*")
//!     → Return: route name, or catch-all sentinel
//! ```
//!
//! # Design Decisions
//! - Routes are dynamic: they exist only while connectors are registered
//! - Resolution is a pure function over any set of known routes
//! - Literal string comparison only; trailing slashes are not special
//! - Caller decides what "catch-all not registered" means (404)

pub mod resolver;
pub mod table;

pub use resolver::{resolve, KnownRoutes};
pub use table::{RouteTable, CATCH_ALL};
