//! Per-exchange error taxonomy and the client-facing error page.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use thiserror::Error;

use crate::proxy::listener::EarlyResponse;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// No connector has ever registered a route matching the path.
    #[error("no route registered for path '{path}'")]
    NoRoute { path: String },

    #[error("no connector available for route '{route}'")]
    NoCapacity { route: String },

    #[error("target host '{host}' is in dark mode")]
    DarkMode { host: String },

    #[error("protocol error from connector on route '{route}': {detail}")]
    Protocol { route: String, detail: String },

    #[error("response headers from connector on route '{route}' exceed {limit} bytes")]
    HeadersTooLarge { route: String, limit: usize },

    #[error("connector on route '{route}' failed: {detail}")]
    Upstream { route: String, detail: String },

    #[error("timed out waiting for connector on route '{route}'")]
    Timeout { route: String },

    #[error("client closed the connection")]
    ClientClosed,

    #[error("{}", .0.message)]
    Vetoed(EarlyResponse),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute { .. } => StatusCode::NOT_FOUND,
            ProxyError::NoCapacity { .. }
            | ProxyError::DarkMode { .. }
            | ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Protocol { .. }
            | ProxyError::HeadersTooLarge { .. }
            | ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // Nobody is left to read it; 499 is what access logs expect.
            ProxyError::ClientClosed => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ProxyError::Vetoed(early) => early.status,
        }
    }

    /// Errors caused by the client rather than the connector.
    pub fn is_client_side(&self) -> bool {
        matches!(self, ProxyError::ClientClosed)
    }

    /// Errors that mean the connector socket can no longer be trusted.
    pub fn is_upstream_fault(&self) -> bool {
        matches!(
            self,
            ProxyError::Protocol { .. }
                | ProxyError::HeadersTooLarge { .. }
                | ProxyError::Upstream { .. }
                | ProxyError::Timeout { .. }
        )
    }

    /// Synthetic HTML response for failures before any response byte was sent.
    pub fn to_response(&self) -> Response<Body> {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        let html = format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1><p>{message}</p></body></html>\n",
            code = status.as_u16(),
            reason = reason,
            message = escape_html(&self.to_string()),
        );

        let mut response = Response::new(Body::from(html));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html;charset=utf-8"),
        );
        response
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
