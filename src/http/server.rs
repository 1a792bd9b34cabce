//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the registration and proxy handlers
//! - Wire up middleware (tracing, request ID)
//! - Bind server to listener
//! - Dispatch client requests to the gateway
//! - Close connector sockets on shutdown

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::http::registration::register_handler;
use crate::proxy::Gateway;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// HTTP server for client traffic and connector registration.
pub struct HttpServer {
    router: Router,
    gateway: Arc<Gateway>,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let state = AppState {
            gateway: gateway.clone(),
        };
        let router = Self::build_router(state);
        Self { router, gateway }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/register", get(register_handler))
            .route("/register/", get(register_handler))
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Run the server until `shutdown` fires, then close connector sockets.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let gateway = self.gateway;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
                gateway.shutdown().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Proxy any request that is not a registration.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    state.gateway.handle(request, client).await
}
