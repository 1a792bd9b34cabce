//! Typed lifecycle events for proxied exchanges.
//!
//! # Responsibilities
//! - Define the closed set of events fired per exchange
//! - Carry an immutable snapshot of exchange state with every event
//! - Let "before" hooks short-circuit an exchange with an early response
//!
//! # Event Order
//! ```text
//! BeforeProxyToTarget ──(veto?)──▶ [acquire] ──fail──▶ FailureToAcquireSocket
//!         │                                                  │
//!         ▼                                                  │
//! RequestBodyChunkSent*                                      │
//! AfterTargetHeadersReceived                                 │
//! BeforeRespondingToClient ──(veto?)                         │
//! ResponseBodyChunkReceived*                                 │
//!         │                                                  │
//!         ▼                                                  ▼
//! Error (when failed) ──────────────────────────────▶ Complete (exactly once)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use bytes::Bytes;

use crate::pool::{ProtocolVersion, SocketId, SocketMeta};
use crate::proxy::error::ProxyError;

/// Structured short-circuit returned by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyResponse {
    pub status: StatusCode,
    pub message: String,
}

impl EarlyResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// The connector socket serving an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRef {
    pub socket_id: SocketId,
    pub component_name: String,
    pub connector_instance_id: String,
    pub protocol: ProtocolVersion,
    pub remote_addr: SocketAddr,
}

impl From<&SocketMeta> for ConnectorRef {
    fn from(meta: &SocketMeta) -> Self {
        Self {
            socket_id: meta.id,
            component_name: meta.component_name.clone(),
            connector_instance_id: meta.connector_instance_id.clone(),
            protocol: meta.protocol,
            remote_addr: meta.remote_addr,
        }
    }
}

/// Snapshot of one exchange.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub route: String,
    pub method: Method,
    pub uri: Uri,
    pub client_addr: SocketAddr,
    pub connector: Option<ConnectorRef>,
    /// v3 stream id, when the exchange ran on a multiplexed socket.
    pub stream_id: Option<u32>,
    /// Status sent to the client, once decided.
    pub status: Option<StatusCode>,
    pub duration: Duration,
    /// Response body bytes written to the client.
    pub bytes_sent: u64,
    /// Request body bytes forwarded to the connector.
    pub bytes_received: u64,
    pub error: Option<ProxyError>,
}

impl ProxyInfo {
    pub fn new(route: impl Into<String>, method: Method, uri: Uri, client_addr: SocketAddr) -> Self {
        Self {
            route: route.into(),
            method,
            uri,
            client_addr,
            connector: None,
            stream_id: None,
            status: None,
            duration: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
            error: None,
        }
    }
}

#[derive(Debug)]
pub enum ProxyEvent<'a> {
    /// Route resolved; request headers already translated.
    BeforeProxyToTarget {
        info: &'a ProxyInfo,
        headers: &'a HeaderMap,
    },
    AfterTargetHeadersReceived {
        info: &'a ProxyInfo,
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    BeforeRespondingToClient {
        info: &'a ProxyInfo,
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    RequestBodyChunkSent {
        info: &'a ProxyInfo,
        chunk: &'a Bytes,
    },
    ResponseBodyChunkReceived {
        info: &'a ProxyInfo,
        chunk: &'a Bytes,
    },
    Complete {
        info: &'a ProxyInfo,
    },
    FailureToAcquireSocket {
        info: &'a ProxyInfo,
        error: &'a ProxyError,
    },
    Error {
        info: &'a ProxyInfo,
        error: &'a ProxyError,
    },
}

impl ProxyEvent<'_> {
    /// Only "before" events may short-circuit the exchange.
    pub fn can_veto(&self) -> bool {
        matches!(
            self,
            ProxyEvent::BeforeProxyToTarget { .. } | ProxyEvent::BeforeRespondingToClient { .. }
        )
    }

    pub fn info(&self) -> &ProxyInfo {
        match self {
            ProxyEvent::BeforeProxyToTarget { info, .. }
            | ProxyEvent::AfterTargetHeadersReceived { info, .. }
            | ProxyEvent::BeforeRespondingToClient { info, .. }
            | ProxyEvent::RequestBodyChunkSent { info, .. }
            | ProxyEvent::ResponseBodyChunkReceived { info, .. }
            | ProxyEvent::Complete { info }
            | ProxyEvent::FailureToAcquireSocket { info, .. }
            | ProxyEvent::Error { info, .. } => *info,
        }
    }
}

/// Hook invoked for every exchange event.
///
/// Returning `Err` from a vetoable event short-circuits the exchange with
/// that response; on other events it is ignored.
pub trait ProxyListener: Send + Sync + 'static {
    fn on_event(&self, event: &ProxyEvent<'_>) -> Result<(), EarlyResponse>;
}

impl<F> ProxyListener for F
where
    F: Fn(&ProxyEvent<'_>) -> Result<(), EarlyResponse> + Send + Sync + 'static,
{
    fn on_event(&self, event: &ProxyEvent<'_>) -> Result<(), EarlyResponse> {
        self(event)
    }
}

/// Box a closure as a listener.
pub fn listener_fn<F>(f: F) -> Arc<dyn ProxyListener>
where
    F: Fn(&ProxyEvent<'_>) -> Result<(), EarlyResponse> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered, shareable listener set.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Vec<Arc<dyn ProxyListener>>>,
}

impl Listeners {
    pub fn new(listeners: Vec<Arc<dyn ProxyListener>>) -> Self {
        Self {
            inner: Arc::new(listeners),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Fire `event` at every listener in order.
    ///
    /// The first veto of a vetoable event stops dispatch and is returned.
    pub fn fire(&self, event: &ProxyEvent<'_>) -> Result<(), EarlyResponse> {
        for listener in self.inner.iter() {
            if let Err(early) = listener.on_event(event) {
                if event.can_veto() {
                    return Err(early);
                }
                tracing::debug!(
                    route = %event.info().route,
                    status = %early.status,
                    "Ignoring veto from non-vetoable event"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}
