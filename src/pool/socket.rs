//! Connector socket identity and bookkeeping shared by both protocols.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// Wire protocol spoken by a connector socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProtocolVersion {
    #[serde(rename = "cranker_1.0")]
    V1,
    #[serde(rename = "cranker_3.0")]
    V3,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 2] = [ProtocolVersion::V3, ProtocolVersion::V1];

    /// The WebSocket subprotocol name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "cranker_1.0",
            ProtocolVersion::V3 => "cranker_3.0",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "cranker_1.0" | "1.0" => Some(ProtocolVersion::V1),
            "cranker_3.0" | "3.0" => Some(ProtocolVersion::V3),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier generated for every registered connector socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(Uuid);

impl SocketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Attributes and counters of one physical connector socket.
#[derive(Debug)]
pub struct SocketMeta {
    pub id: SocketId,
    pub route: String,
    pub component_name: String,
    pub connector_instance_id: String,
    pub protocol: ProtocolVersion,
    pub remote_addr: SocketAddr,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    removed: AtomicBool,
    error: Mutex<Option<String>>,
}

impl SocketMeta {
    pub fn new(
        route: impl Into<String>,
        component_name: impl Into<String>,
        connector_instance_id: impl Into<String>,
        protocol: ProtocolVersion,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id: SocketId::new(),
            route: route.into(),
            component_name: component_name.into(),
            connector_instance_id: connector_instance_id.into(),
            protocol,
            remote_addr,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            removed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Bytes written toward the connector.
    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes read from the connector.
    pub fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Flip the socket into the removed state.
    ///
    /// Returns true only for the caller that performed the transition.
    pub fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn set_error(&self, error: impl Into<String>) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_catch_all(&self) -> bool {
        self.route == crate::routing::CATCH_ALL
    }
}

/// A socket type that can live in a [`ConnectorPool`](super::ConnectorPool).
pub trait PooledSocket: Send + Sync + 'static {
    fn meta(&self) -> &SocketMeta;

    /// Whether a client response is currently outstanding on this socket.
    fn has_response(&self) -> bool {
        false
    }
}
