//! HTTP front end subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!         GET /register/?route=…  → registration.rs → WebSocket → gateway pool
//!         anything else           → gateway.handle → connector → client
//! ```

pub mod registration;
pub mod server;

pub use registration::{offered_protocols, RegistrationParams};
pub use server::{AppState, HttpServer};
