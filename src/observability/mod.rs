//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and histograms from proxy lifecycle events)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID (x-request-id) is set at the edge and forwarded to connectors
//! - Metrics are cheap (atomic increments) and optional

pub mod logging;
pub mod metrics;

pub use self::metrics::{init_metrics, MetricsListener};
