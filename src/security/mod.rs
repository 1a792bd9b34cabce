//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Connector registration:
//!     → ip_allow.rs (reject unlisted peers with 403)
//!     → pool registration
//!
//! Client request:
//!     → dark_mode.rs (target host dark? 503 before any pool access)
//!     → proxying
//! ```
//!
//! # Design Decisions
//! - Both checks are plain predicates; the caller picks the response
//! - Dark-mode state is shared and mutable at runtime via the admin API

pub mod dark_mode;
pub mod ip_allow;

pub use dark_mode::DarkModeManager;
pub use ip_allow::{InvalidEntry, IpAllowList};
