//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → HTTP server stops accepting
//!             → gateway closes connector sockets (1001), fails queued requests
//!             → admin API stops
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//! ```
//!
//! # Design Decisions
//! - Ordered startup in main: config, logging, metrics, gateway, listeners
//! - One broadcast trigger; every long-running task subscribes

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{spawn_signal_handler, wait_for_signal};
