//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Record per-exchange metrics from proxy lifecycle events
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): completed exchanges by route, status
//! - `gateway_request_duration_seconds` (histogram): exchange latency by route
//! - `gateway_acquire_failures_total` (counter): capacity failures by route
//! - `gateway_request_errors_total` (counter): failed exchanges by route, kind
//! - `gateway_connector_sockets` (gauge): registered sockets by protocol
//!
//! # Design Decisions
//! - Metrics hang off the listener hooks; the proxy core has no metrics calls
//!   beyond the socket gauge
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::proxy::error::ProxyError;
use crate::proxy::listener::{EarlyResponse, ProxyEvent, ProxyListener};

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Short label for an error kind.
pub fn error_kind(error: &ProxyError) -> &'static str {
    match error {
        ProxyError::NoRoute { .. } => "no_route",
        ProxyError::NoCapacity { .. } => "no_capacity",
        ProxyError::DarkMode { .. } => "dark_mode",
        ProxyError::Protocol { .. } => "protocol",
        ProxyError::HeadersTooLarge { .. } => "headers_too_large",
        ProxyError::Upstream { .. } => "upstream",
        ProxyError::Timeout { .. } => "timeout",
        ProxyError::ClientClosed => "client_closed",
        ProxyError::Vetoed(_) => "vetoed",
        ProxyError::ShuttingDown => "shutting_down",
    }
}

/// Listener that turns lifecycle events into metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsListener;

impl MetricsListener {
    pub fn shared() -> Arc<dyn ProxyListener> {
        Arc::new(Self)
    }
}

impl ProxyListener for MetricsListener {
    fn on_event(&self, event: &ProxyEvent<'_>) -> Result<(), EarlyResponse> {
        match event {
            ProxyEvent::Complete { info } => {
                let route = info.route.clone();
                let status = info.status.map(|s| s.as_u16()).unwrap_or(0).to_string();
                metrics::counter!("gateway_requests_total", "route" => route.clone(), "status" => status)
                    .increment(1);
                metrics::histogram!("gateway_request_duration_seconds", "route" => route)
                    .record(info.duration.as_secs_f64());
            }
            ProxyEvent::FailureToAcquireSocket { info, .. } => {
                metrics::counter!("gateway_acquire_failures_total", "route" => info.route.clone())
                    .increment(1);
            }
            ProxyEvent::Error { info, error } => {
                metrics::counter!(
                    "gateway_request_errors_total",
                    "route" => info.route.clone(),
                    "kind" => error_kind(error)
                )
                .increment(1);
            }
            _ => {}
        }
        Ok(())
    }
}
