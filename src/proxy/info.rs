//! Serializable snapshot of registered connectors.
//!
//! Grouped route → component → connector instance → connections, in
//! sorted order so repeated snapshots diff cleanly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pool::PooledSocket;
use crate::security::DarkModeManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfo {
    pub services: Vec<ServiceInfo>,
    pub dark_hosts: Vec<String>,
    pub idle_v1_sockets: usize,
    pub idle_v3_sockets: usize,
}

impl RouterInfo {
    pub fn service(&self, route: &str) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.route == route)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub route: String,
    pub is_catch_all: bool,
    pub components: Vec<ComponentInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    pub component_name: String,
    pub instances: Vec<ConnectorInstanceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorInstanceInfo {
    pub connector_instance_id: String,
    pub ip: String,
    pub dark_mode: bool,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub port: u16,
    pub socket_id: String,
    pub protocol: String,
    /// v1 only: whether a client response is outstanding.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_response: Option<bool>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

type InstanceKey = (String, String);

/// Accumulates sockets of either protocol into a [`RouterInfo`].
#[derive(Default)]
pub(crate) struct InfoBuilder {
    tree: BTreeMap<String, BTreeMap<String, BTreeMap<InstanceKey, Vec<ConnectionInfo>>>>,
}

impl InfoBuilder {
    pub(crate) fn add<S: PooledSocket>(&mut self, socket: &S, reports_response: bool) {
        let meta = socket.meta();
        let ip = meta.remote_addr.ip().to_canonical().to_string();
        self.tree
            .entry(meta.route.clone())
            .or_default()
            .entry(meta.component_name.clone())
            .or_default()
            .entry((meta.connector_instance_id.clone(), ip))
            .or_default()
            .push(ConnectionInfo {
                port: meta.remote_addr.port(),
                socket_id: meta.id.to_string(),
                protocol: meta.protocol.as_str().to_string(),
                has_response: reports_response.then(|| socket.has_response()),
                bytes_sent: meta.bytes_sent(),
                bytes_received: meta.bytes_received(),
                error: meta.error(),
            });
    }

    pub(crate) fn build(self, dark: &DarkModeManager, idle_v1: usize, idle_v3: usize) -> RouterInfo {
        let services = self
            .tree
            .into_iter()
            .map(|(route, components)| ServiceInfo {
                is_catch_all: route == crate::routing::CATCH_ALL,
                route,
                components: components
                    .into_iter()
                    .map(|(component_name, instances)| ComponentInfo {
                        component_name,
                        instances: instances
                            .into_iter()
                            .map(|((connector_instance_id, ip), mut connections)| {
                                connections.sort_by(|a, b| a.socket_id.cmp(&b.socket_id));
                                ConnectorInstanceInfo {
                                    dark_mode: dark.is_dark(&ip),
                                    connector_instance_id,
                                    ip,
                                    connections,
                                }
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        RouterInfo {
            services,
            dark_hosts: dark.hosts(),
            idle_v1_sockets: idle_v1,
            idle_v3_sockets: idle_v3,
        }
    }
}
