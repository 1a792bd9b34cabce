use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::proxy::RouterInfo;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub uptime_secs: u64,
    pub routes: Vec<String>,
    pub idle_v1_sockets: usize,
    pub idle_v3_sockets: usize,
    pub dark_hosts: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DarkHostChange {
    pub host: String,
    pub changed: bool,
    pub hosts: Vec<String>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let gateway = &state.gateway;
    let mut routes = gateway.routes().routes();
    routes.sort();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        routes,
        idle_v1_sockets: gateway.v1_pool().idle_count(),
        idle_v3_sockets: gateway.v3_pool().idle_count(),
        dark_hosts: gateway.dark_mode().len(),
    })
}

pub async fn get_connectors(State(state): State<AdminState>) -> Json<RouterInfo> {
    Json(state.gateway.collect_info())
}

pub async fn get_dark_hosts(State(state): State<AdminState>) -> Json<Vec<String>> {
    Json(state.gateway.dark_mode().hosts())
}

/// Take every host out of dark mode.
pub async fn clear_dark_hosts(State(state): State<AdminState>) -> Json<Vec<String>> {
    let dark = state.gateway.dark_mode();
    let cleared = dark.hosts();
    dark.clear();
    tracing::info!(count = cleared.len(), "Dark mode cleared");
    Json(cleared)
}

pub async fn enable_dark_host(
    State(state): State<AdminState>,
    Path(host): Path<String>,
) -> Json<DarkHostChange> {
    let dark = state.gateway.dark_mode();
    let changed = dark.enable(&host);
    Json(DarkHostChange {
        host,
        changed,
        hosts: dark.hosts(),
    })
}

pub async fn disable_dark_host(
    State(state): State<AdminState>,
    Path(host): Path<String>,
) -> Json<DarkHostChange> {
    let dark = state.gateway.dark_mode();
    let changed = dark.disable(&host);
    Json(DarkHostChange {
        host,
        changed,
        hosts: dark.hosts(),
    })
}
