//! Connector transport subsystem.
//!
//! # Data Flow
//! ```text
//! Connector WebSocket (axum)
//!     → transport.rs pump (read half)  → SocketEvent channel → session / demux
//!     ← transport.rs pump (write half) ← Outbound channel    ← session / streams
//! ```
//!
//! # Design Decisions
//! - Sessions never touch the WebSocket directly; they see two channels,
//!   which keeps them testable without a network
//! - One pump task per connector socket owns both halves
//! - Pings are sent only after a quiet period on the write side

pub mod transport;

pub use transport::{pump, Attachment, Outbound, PeerLink, SocketEvent, SocketLink};
