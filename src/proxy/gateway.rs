//! Proxy orchestrator.
//!
//! # Responsibilities
//! - Accept connector sockets into the pool of their protocol
//! - Resolve each client request to a route, borrow a socket, hand off
//! - Short-circuit unknown routes, dark hosts, vetoes and capacity failures
//! - Report registered connectors for the admin API
//!
//! # Request Flow
//! ```text
//! handle(request)
//!     → resolve(path)                 unknown route    → 404
//!     → dark_mode.is_dark(host)       dark             → 503
//!     → translate headers
//!     → BeforeProxyToTarget           veto             → listener's status
//!     → acquire (v3 idle, v1 idle,
//!                then wait on one)    no capacity      → 503
//!     → spawn ExchangeSession / StreamSession
//!     → await response head
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::http::{header, HeaderMap, Request, Response};
use tokio::sync::mpsc;

use crate::config::{GatewayConfig, RouterConfig};
use crate::net::{pump, SocketLink};
use crate::pool::{AcquireError, ConnectorPool, PooledSocket, ProtocolVersion, SocketMeta};
use crate::protocol::close_code;
use crate::proxy::error::ProxyError;
use crate::proxy::forwarded::ForwardingPolicy;
use crate::proxy::info::{InfoBuilder, RouterInfo};
use crate::proxy::listener::{ConnectorRef, Listeners, ProxyEvent, ProxyInfo};
use crate::routing::{resolve, RouteTable};
use crate::security::{DarkModeManager, InvalidEntry, IpAllowList};
use crate::session::v3::StreamEvent;
use crate::session::{
    run_demux, ClientExchange, ExchangeContext, ExchangeSession, ProxyRequest, StreamSession,
    V1Socket, V3Socket,
};

/// The front end only speaks plain HTTP.
const CLIENT_SCHEME: &str = "http";

/// Runtime settings derived from [`RouterConfig`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub connector_max_wait: Duration,
    pub idle_read_timeout: Duration,
    pub ping_after_write: Option<Duration>,
    pub v3_initial_window: u32,
    /// Accepted protocols, most preferred first.
    pub supported_protocols: Vec<ProtocolVersion>,
    pub forwarding: ForwardingPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

impl From<&RouterConfig> for GatewaySettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            connector_max_wait: config.connector_max_wait(),
            idle_read_timeout: config.idle_read_timeout(),
            ping_after_write: config.ping_after_write(),
            v3_initial_window: config.v3_initial_window,
            supported_protocols: config
                .supported_protocols
                .iter()
                .filter_map(|name| ProtocolVersion::from_name(name))
                .collect(),
            forwarding: ForwardingPolicy::from(config),
        }
    }
}

/// A connector that completed the registration handshake.
#[derive(Debug, Clone)]
pub struct ConnectorRegistration {
    pub route: String,
    pub component_name: String,
    pub connector_instance_id: String,
    pub protocol: ProtocolVersion,
    pub remote_addr: SocketAddr,
}

enum Borrowed {
    V1(Arc<V1Socket>),
    V3 {
        socket: Arc<V3Socket>,
        stream_id: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    },
}

/// Routes client requests over connector sockets.
pub struct Gateway {
    routes: Arc<RouteTable>,
    v1: Arc<ConnectorPool<V1Socket>>,
    v3: Arc<ConnectorPool<V3Socket>>,
    settings: GatewaySettings,
    allow_list: IpAllowList,
    dark_mode: Arc<DarkModeManager>,
    listeners: Listeners,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        allow_list: IpAllowList,
        dark_mode: Arc<DarkModeManager>,
        listeners: Listeners,
    ) -> Self {
        let routes = Arc::new(RouteTable::new());
        let v1 = Arc::new(ConnectorPool::new(
            ProtocolVersion::V1,
            routes.clone(),
            settings.connector_max_wait,
        ));
        let v3 = Arc::new(ConnectorPool::new(
            ProtocolVersion::V3,
            routes.clone(),
            settings.connector_max_wait,
        ));
        Self {
            routes,
            v1,
            v3,
            settings,
            allow_list,
            dark_mode,
            listeners,
        }
    }

    pub fn from_config(config: &GatewayConfig, listeners: Listeners) -> Result<Self, InvalidEntry> {
        let allow_list = IpAllowList::from_entries(&config.registration.allowed_ips)?;
        let dark_mode = Arc::new(DarkModeManager::with_hosts(&config.dark_mode.hosts));
        Ok(Self::new(
            GatewaySettings::from(&config.router),
            allow_list,
            dark_mode,
            listeners,
        ))
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn v1_pool(&self) -> &Arc<ConnectorPool<V1Socket>> {
        &self.v1
    }

    pub fn v3_pool(&self) -> &Arc<ConnectorPool<V3Socket>> {
        &self.v3
    }

    pub fn dark_mode(&self) -> &Arc<DarkModeManager> {
        &self.dark_mode
    }

    pub fn registration_allowed(&self, ip: IpAddr) -> bool {
        self.allow_list.allows(ip)
    }

    /// Pick the most preferred supported protocol among those offered.
    pub fn negotiate<'a, I>(&self, offered: I) -> Option<ProtocolVersion>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let offered: Vec<ProtocolVersion> =
            offered.into_iter().filter_map(ProtocolVersion::from_name).collect();
        self.settings
            .supported_protocols
            .iter()
            .copied()
            .find(|p| offered.contains(p))
    }

    /// Proxy one client request.
    pub async fn handle(&self, request: Request<Body>, client_addr: SocketAddr) -> Response<Body> {
        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();
        let route = resolve(&*self.routes, &path).to_string();

        let info = ProxyInfo::new(
            route.clone(),
            parts.method.clone(),
            parts.uri.clone(),
            client_addr,
        );
        let mut ctx = ExchangeContext::new(info, started, self.listeners.clone());

        if !self.routes.contains(&route) {
            tracing::debug!(path = %path, "No route for request");
            return reject(ctx, ProxyError::NoRoute { path });
        }

        if let Some(host) = target_host(&parts.headers, &parts.uri) {
            if self.dark_mode.is_dark(&host) {
                return reject(ctx, ProxyError::DarkMode { host });
            }
        }

        let headers = self
            .settings
            .forwarding
            .translate(&parts.headers, client_addr, CLIENT_SCHEME);
        let before = ProxyEvent::BeforeProxyToTarget {
            info: ctx.info(),
            headers: &headers,
        };
        if let Err(early) = self.listeners.fire(&before) {
            return reject(ctx, ProxyError::Vetoed(early));
        }

        let borrowed = match self.acquire(&route).await {
            Ok(borrowed) => borrowed,
            Err(e) => {
                let error = match e {
                    AcquireError::NoCapacity { .. } => ProxyError::NoCapacity {
                        route: route.clone(),
                    },
                    AcquireError::Closed => ProxyError::ShuttingDown,
                };
                tracing::warn!(route = %route, error = %e, "Failed to acquire connector socket");
                let _ = self.listeners.fire(&ProxyEvent::FailureToAcquireSocket {
                    info: ctx.info(),
                    error: &error,
                });
                return reject(ctx, error);
            }
        };

        let request = ProxyRequest {
            has_body: request_has_body(&parts.headers),
            target: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or(path),
            method: parts.method,
            headers,
            body,
        };

        let (client, head_rx) = ClientExchange::new();
        let idle_timeout = self.settings.idle_read_timeout;
        match borrowed {
            Borrowed::V1(socket) => {
                ctx.info_mut().connector = Some(ConnectorRef::from(socket.meta()));
                let session = ExchangeSession::new(socket, self.v1.clone(), ctx, client, idle_timeout);
                tokio::spawn(session.run(request));
            }
            Borrowed::V3 {
                socket,
                stream_id,
                events,
            } => {
                ctx.info_mut().connector = Some(ConnectorRef::from(socket.meta()));
                let session = StreamSession::new(
                    socket,
                    self.v3.clone(),
                    stream_id,
                    events,
                    ctx,
                    client,
                    idle_timeout,
                    self.settings.v3_initial_window,
                );
                tokio::spawn(session.run(request));
            }
        }

        match head_rx.await {
            Ok(response) => response,
            // The session always answers; this only happens if its task panicked.
            Err(_) => ProxyError::Upstream {
                route,
                detail: "exchange ended without a response".to_string(),
            }
            .to_response(),
        }
    }

    /// Borrow a socket for `route`, preferring an idle v3 socket.
    async fn acquire(&self, route: &str) -> Result<Borrowed, AcquireError> {
        loop {
            let socket = if let Some(socket) = self.v3.try_acquire(route) {
                socket
            } else if let Some(socket) = self.v1.try_acquire(route) {
                return Ok(Borrowed::V1(socket));
            } else if self.v3.has_route(route) {
                self.v3.acquire(route).await?
            } else {
                return self.v1.acquire(route).await.map(Borrowed::V1);
            };

            match socket.open_stream() {
                Some((stream_id, events)) => {
                    return Ok(Borrowed::V3 {
                        socket,
                        stream_id,
                        events,
                    })
                }
                // The socket failed after it was pooled; drop it and try again.
                None => {
                    self.v3.remove(&socket);
                }
            }
        }
    }

    /// Serve a registered connector socket until it disconnects.
    pub async fn accept_connector(&self, ws: WebSocket, registration: ConnectorRegistration) {
        let meta = SocketMeta::new(
            registration.route,
            registration.component_name,
            registration.connector_instance_id,
            registration.protocol,
            registration.remote_addr,
        );
        tracing::info!(
            route = %meta.route,
            component = %meta.component_name,
            protocol = %meta.protocol,
            socket_id = %meta.id,
            remote = %meta.remote_addr,
            "Connector socket registered"
        );
        metrics::gauge!("gateway_connector_sockets", "protocol" => meta.protocol.as_str())
            .increment(1.0);

        let protocol = meta.protocol;
        let route = meta.route.clone();
        let socket_id = meta.id;
        let (link, peer) = SocketLink::pair();
        let ping_after = self.settings.ping_after_write;

        let end = match protocol {
            ProtocolVersion::V1 => {
                let socket = Arc::new(V1Socket::new(meta, link));
                self.v1.register(socket.clone());
                let end = pump(ws, peer, ping_after).await;
                self.v1.remove(&socket);
                end
            }
            ProtocolVersion::V3 => {
                let SocketLink {
                    outbound,
                    inbound,
                    attachment,
                } = link;
                // The demux reads for the whole life of the socket.
                attachment.attach();
                let socket = Arc::new(V3Socket::new(meta, outbound));
                self.v3.register(socket.clone());
                let demux = tokio::spawn(run_demux(socket, self.v3.clone(), inbound));
                let end = pump(ws, peer, ping_after).await;
                let _ = demux.await;
                end
            }
        };

        metrics::gauge!("gateway_connector_sockets", "protocol" => protocol.as_str())
            .decrement(1.0);
        tracing::info!(
            route = %route,
            socket_id = %socket_id,
            protocol = %protocol,
            end = ?end,
            "Connector socket disconnected"
        );
    }

    /// Snapshot of every registered connector socket.
    pub fn collect_info(&self) -> RouterInfo {
        let mut builder = InfoBuilder::default();
        for socket in self.v1.snapshot() {
            builder.add(&*socket, true);
        }
        for socket in self.v3.snapshot() {
            builder.add(&*socket, false);
        }
        builder.build(&self.dark_mode, self.v1.idle_count(), self.v3.idle_count())
    }

    /// Close every connector socket and fail queued acquisitions.
    pub async fn shutdown(&self) {
        let v1 = self.v1.shutdown();
        let v3 = self.v3.shutdown();
        tracing::info!(
            v1_sockets = v1.len(),
            v3_sockets = v3.len(),
            "Closing connector sockets"
        );
        for socket in v1 {
            socket.close(close_code::GOING_AWAY, "gateway shutting down").await;
        }
        for socket in v3 {
            socket.fail_all("gateway shutting down");
            socket.close(close_code::GOING_AWAY, "gateway shutting down").await;
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("routes", &self.routes.len())
            .field("idle_v1", &self.v1.idle_count())
            .field("idle_v3", &self.v3.idle_count())
            .finish()
    }
}

fn reject(ctx: ExchangeContext, error: ProxyError) -> Response<Body> {
    let response = error.to_response();
    ctx.complete(Some(error));
    response
}

fn target_host(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
}

/// Whether the client request carries a body to forward.
pub fn request_has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}
