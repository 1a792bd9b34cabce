//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener serving both client traffic and connector registration.
    pub listener: ListenerConfig,

    /// Routing, pooling and proxying behaviour.
    pub router: RouterConfig,

    /// Connector registration policy.
    pub registration: RegistrationConfig,

    /// Hosts that start out dark.
    pub dark_mode: DarkModeConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Longest a request may queue for a connector socket.
    pub connector_max_wait_ms: u64,

    /// Idle-read timeout on a borrowed connector socket.
    pub idle_read_timeout_ms: u64,

    /// Ping a connector after this long without an outbound write (0 disables).
    pub ping_after_write_ms: u64,

    /// Name used in the `Via` header.
    pub via_name: String,

    /// Drop `Forwarded` and `X-Forwarded-*` headers sent by clients.
    pub discard_client_forwarded_headers: bool,

    /// Also send `X-Forwarded-For/Proto/Host`.
    pub send_legacy_forwarded_headers: bool,

    /// Pass the client's `Host` header to connectors.
    pub proxy_host_header: bool,

    /// Protocols accepted at registration, in preference order.
    pub supported_protocols: Vec<String>,

    /// Request body bytes a v3 stream may send before its first window update.
    pub v3_initial_window: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            connector_max_wait_ms: 5_000,
            idle_read_timeout_ms: 300_000,
            ping_after_write_ms: 10_000,
            via_name: "muc".to_string(),
            discard_client_forwarded_headers: false,
            send_legacy_forwarded_headers: false,
            proxy_host_header: true,
            supported_protocols: vec!["cranker_3.0".to_string(), "cranker_1.0".to_string()],
            v3_initial_window: 64 * 1024,
        }
    }
}

impl RouterConfig {
    pub fn connector_max_wait(&self) -> Duration {
        Duration::from_millis(self.connector_max_wait_ms)
    }

    pub fn idle_read_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_read_timeout_ms)
    }

    pub fn ping_after_write(&self) -> Option<Duration> {
        (self.ping_after_write_ms > 0).then(|| Duration::from_millis(self.ping_after_write_ms))
    }
}

/// Connector registration policy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RegistrationConfig {
    /// IP literals or `localhost`; empty admits everyone.
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DarkModeConfig {
    pub hosts: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
