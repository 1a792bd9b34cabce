//! Connector pool subsystem.
//!
//! # Data Flow
//! ```text
//! Connector socket registers
//!     → connector_pool.rs register()
//!         → oldest waiter for the route?  hand socket over directly
//!         → otherwise                      push onto the route's idle list
//!
//! Request for route R
//!     → acquire(R)
//!         → idle socket?  return immediately
//!         → otherwise     queue a waiter, suspend until
//!                         register/release hands one over, or max wait elapses
//! ```
//!
//! # Design Decisions
//! - One pool per protocol version, owned by the gateway (no globals)
//! - Waiters are oneshot channels in a per-route FIFO; no thread ever blocks
//! - The lock is held only for queue bookkeeping, never across an await
//! - Exceeding the max wait is a typed failure, distinct from socket errors

pub mod connector_pool;
pub mod socket;

pub use connector_pool::{AcquireError, ConnectorPool};
pub use socket::{PooledSocket, ProtocolVersion, SocketId, SocketMeta};
