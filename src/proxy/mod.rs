//! Proxy orchestration subsystem.
//!
//! # Data Flow
//! ```text
//! Client request (http server)
//!     → gateway.rs   resolve route, dark-mode check, acquire socket
//!     → forwarded.rs hop-by-hop stripping, Via / Forwarded headers
//!     → listener.rs  BeforeProxyToTarget (may veto)
//!     → session      v1 exchange or v3 stream
//!     → error.rs     HTML error page when nothing was sent yet
//!
//! Connector registration (http server)
//!     → gateway.rs accept_connector → pool of the negotiated protocol
//!
//! Admin API
//!     → gateway.rs collect_info → info.rs snapshot
//! ```
//!
//! # Design Decisions
//! - Lifecycle hooks are a closed set of typed events, not optional methods
//! - A veto is a returned value, checked at each vetoable stage
//! - The gateway owns both pools and the route table; nothing is global

pub mod error;
pub mod forwarded;
pub mod gateway;
pub mod info;
pub mod listener;

pub use error::ProxyError;
pub use forwarded::ForwardingPolicy;
pub use gateway::{ConnectorRegistration, Gateway, GatewaySettings};
pub use info::RouterInfo;
pub use listener::{listener_fn, EarlyResponse, Listeners, ProxyEvent, ProxyInfo, ProxyListener};
