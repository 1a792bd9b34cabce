//! Request header translation toward connectors.
//!
//! # Responsibilities
//! - Strip hop-by-hop request headers
//! - Optionally drop client-supplied forwarding headers
//! - Append `Via` and RFC 7239 `Forwarded`, plus legacy `X-Forwarded-*`
//! - Optionally drop `Host`

use std::net::{IpAddr, SocketAddr};

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::RouterConfig;
use crate::protocol::strip_hop_by_hop;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

#[derive(Debug, Clone)]
pub struct ForwardingPolicy {
    pub via_name: String,
    pub discard_client_forwarded_headers: bool,
    pub send_legacy_forwarded_headers: bool,
    pub proxy_host_header: bool,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            via_name: "muc".to_string(),
            discard_client_forwarded_headers: false,
            send_legacy_forwarded_headers: false,
            proxy_host_header: true,
        }
    }
}

impl From<&RouterConfig> for ForwardingPolicy {
    fn from(config: &RouterConfig) -> Self {
        Self {
            via_name: config.via_name.clone(),
            discard_client_forwarded_headers: config.discard_client_forwarded_headers,
            send_legacy_forwarded_headers: config.send_legacy_forwarded_headers,
            proxy_host_header: config.proxy_host_header,
        }
    }
}

impl ForwardingPolicy {
    /// Headers to send to the connector for a client request.
    pub fn translate(&self, headers: &HeaderMap, client: SocketAddr, scheme: &str) -> HeaderMap {
        let mut out = headers.clone();
        strip_hop_by_hop(&mut out, false);

        if self.discard_client_forwarded_headers {
            out.remove(header::FORWARDED);
            out.remove(X_FORWARDED_FOR);
            out.remove(X_FORWARDED_PROTO);
            out.remove(X_FORWARDED_HOST);
        }

        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        if !self.proxy_host_header {
            out.remove(header::HOST);
        }

        append(&mut out, header::VIA, &format!("HTTP/1.1 {}", self.via_name));
        append(
            &mut out,
            header::FORWARDED,
            &forwarded_element(client.ip(), scheme, host.as_deref()),
        );

        if self.send_legacy_forwarded_headers {
            append(&mut out, X_FORWARDED_FOR, &client.ip().to_canonical().to_string());
            if !out.contains_key(X_FORWARDED_PROTO) {
                set(&mut out, X_FORWARDED_PROTO, scheme);
            }
            if let Some(host) = &host {
                if !out.contains_key(X_FORWARDED_HOST) {
                    set(&mut out, X_FORWARDED_HOST, host);
                }
            }
        }
        out
    }
}

/// One `Forwarded` element describing this hop.
pub fn forwarded_element(client: IpAddr, scheme: &str, host: Option<&str>) -> String {
    let mut element = match client.to_canonical() {
        IpAddr::V4(ip) => format!("for={ip}"),
        IpAddr::V6(ip) => format!("for=\"[{ip}]\""),
    };
    element.push_str(";proto=");
    element.push_str(scheme);
    if let Some(host) = host {
        element.push_str(";host=");
        if host.bytes().all(is_tchar) {
            element.push_str(host);
        } else {
            element.push('"');
            element.push_str(host);
            element.push('"');
        }
    }
    element
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Fold existing values of `name` into one and append `value`.
fn append(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let mut joined: Vec<&str> = headers
        .get_all(&name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    joined.push(value);
    let combined = joined.join(", ");
    set(headers, name, &combined);
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::debug!(header = %name, "Skipping unrepresentable header value"),
    }
}
