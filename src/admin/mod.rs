//! Admin API.
//!
//! Bearer-protected JSON endpoints on their own listener:
//! ```text
//! GET    /admin/status              routes, idle sockets, uptime
//! GET    /admin/connectors          collect_info snapshot
//! GET    /admin/dark-hosts          dark host list
//! PUT    /admin/dark-hosts/{host}   enable dark mode for host
//! DELETE /admin/dark-hosts/{host}   disable dark mode for host
//! ```

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::proxy::Gateway;

#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>, api_key: &str) -> Self {
        Self {
            gateway,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/connectors", get(get_connectors))
        .route("/admin/dark-hosts", get(get_dark_hosts).delete(clear_dark_hosts))
        .route(
            "/admin/dark-hosts/{host}",
            axum::routing::put(enable_dark_host).delete(disable_dark_host),
        )
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
