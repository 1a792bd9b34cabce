//! Connector registration handshake.
//!
//! # Responsibilities
//! - Check the connector's address against the allow-list (403)
//! - Negotiate the protocol from `Sec-WebSocket-Protocol` or the legacy
//!   `CrankerProtocol` header (400 when nothing supported is offered)
//! - Upgrade to a WebSocket and hand it to the gateway
//!
//! A connector that names no protocol at all is treated as a legacy
//! `cranker_1.0` connector.

use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::http::server::AppState;
use crate::pool::ProtocolVersion;
use crate::proxy::ConnectorRegistration;
use crate::routing::CATCH_ALL;

/// Legacy protocol header sent by older connectors.
pub const CRANKER_PROTOCOL_HEADER: &str = "crankerprotocol";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationParams {
    pub route: Option<String>,
    pub component_name: Option<String>,
    #[serde(rename = "connectorInstanceID")]
    pub connector_instance_id: Option<String>,
}

impl RegistrationParams {
    fn into_registration(self, protocol: ProtocolVersion, remote_addr: SocketAddr) -> ConnectorRegistration {
        let route = self
            .route
            .map(|r| r.trim_matches('/').to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| CATCH_ALL.to_string());
        ConnectorRegistration {
            route,
            component_name: self.component_name.unwrap_or_else(|| "unknown".to_string()),
            connector_instance_id: self
                .connector_instance_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            protocol,
            remote_addr,
        }
    }
}

/// Protocol names offered by the connector, in its order.
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    let mut offered: Vec<String> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if let Some(legacy) = headers
        .get(CRANKER_PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        offered.push(legacy.trim().to_string());
    }
    if offered.is_empty() {
        offered.push(ProtocolVersion::V1.as_str().to_string());
    }
    offered
}

pub async fn register_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<RegistrationParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.gateway.registration_allowed(remote.ip()) {
        tracing::warn!(remote = %remote, route = ?params.route, "Connector registration refused by allow-list");
        return (StatusCode::FORBIDDEN, "Connector address not allowed").into_response();
    }

    let offered = offered_protocols(&headers);
    let Some(protocol) = state.gateway.negotiate(offered.iter().map(String::as_str)) else {
        tracing::warn!(
            remote = %remote,
            offered = ?offered,
            "Connector offered no supported protocol"
        );
        return (
            StatusCode::BAD_REQUEST,
            format!("Unsupported cranker protocol: {}", offered.join(", ")),
        )
            .into_response();
    };

    let registration = params.into_registration(protocol, remote);
    let gateway = state.gateway.clone();
    ws.protocols([protocol.as_str()])
        .on_upgrade(move |socket| async move { gateway.accept_connector(socket, registration).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_offered_protocols_from_subprotocol_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("cranker_3.0, cranker_1.0"),
        );
        assert_eq!(offered_protocols(&headers), vec!["cranker_3.0", "cranker_1.0"]);
    }

    #[test]
    fn test_legacy_header_and_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(offered_protocols(&headers), vec!["cranker_1.0"]);
        headers.insert(CRANKER_PROTOCOL_HEADER, HeaderValue::from_static("1.0"));
        assert_eq!(offered_protocols(&headers), vec!["1.0"]);
    }

    #[test]
    fn test_registration_defaults() {
        let remote: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let registration = RegistrationParams::default().into_registration(ProtocolVersion::V3, remote);
        assert_eq!(registration.route, CATCH_ALL);
        assert_eq!(registration.component_name, "unknown");
        assert!(!registration.connector_instance_id.is_empty());

        let registration = RegistrationParams {
            route: Some("/svc/".to_string()),
            component_name: Some("svc-app".to_string()),
            connector_instance_id: Some("inst-7".to_string()),
        }
        .into_registration(ProtocolVersion::V1, remote);
        assert_eq!(registration.route, "svc");
        assert_eq!(registration.connector_instance_id, "inst-7");
    }
}
