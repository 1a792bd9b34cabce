//! Cranker-style reverse-proxy gateway library.
//!
//! Connectors behind NAT open WebSocket connections *into* the gateway and
//! register a route; client requests for that route are proxied back over
//! those sockets using protocol v1 (one exchange per socket) or v3
//! (multiplexed, flow-controlled streams).

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod routing;
pub mod security;
pub mod session;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::Gateway;
