//! Crank gateway
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                      GATEWAY                         │
//!   Client request       │  ┌────────┐   ┌─────────┐   ┌───────────────┐         │
//!   ─────────────────────┼─▶│  http  │──▶│ routing │──▶│ pool (v1, v3) │         │
//!                        │  │ server │   │ resolve │   │ acquire/wait  │         │
//!                        │  └────────┘   └─────────┘   └───────┬───────┘         │
//!                        │                                     ▼                 │
//!   Client response      │  ┌────────┐   ┌──────────────────────────┐            │  connector
//!   ◀────────────────────┼──│ client │◀──│ session (v1 exchange /   │◀═══════════╪══ WebSocket
//!                        │  │exchange│   │ v3 stream) + protocol    │            │  (registered
//!                        │  └────────┘   └──────────────────────────┘            │   inbound)
//!                        │                                                       │
//!                        │   config · security · observability · lifecycle       │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use crank_gateway::admin::{setup_admin_router, AdminState};
use crank_gateway::config::{load_config, GatewayConfig};
use crank_gateway::lifecycle::{spawn_signal_handler, Shutdown};
use crank_gateway::observability::{self, MetricsListener};
use crank_gateway::proxy::{Gateway, Listeners};
use crank_gateway::HttpServer;

#[derive(Parser)]
#[command(name = "crank-gateway")]
#[command(about = "Reverse-proxy gateway for connectors that dial in", long_about = None)]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    observability::logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "crank-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_wait_ms = config.router.connector_max_wait_ms,
        idle_timeout_ms = config.router.idle_read_timeout_ms,
        protocols = ?config.router.supported_protocols,
        "Configuration loaded"
    );

    let mut listeners = Vec::new();
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => match observability::init_metrics(addr) {
                Ok(()) => listeners.push(MetricsListener::shared()),
                Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
            },
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let gateway = Arc::new(Gateway::from_config(&config, Listeners::new(listeners))?);
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        let app = setup_admin_router(AdminState::new(gateway.clone(), &config.admin.api_key));
        let mut admin_shutdown = shutdown.subscribe();
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for clients and connectors");

    HttpServer::new(gateway)
        .run(listener, shutdown.subscribe())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
