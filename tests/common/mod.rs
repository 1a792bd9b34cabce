//! Shared utilities for integration tests: a running gateway plus fake
//! connectors that register over real WebSockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crank_gateway::protocol::v1::{MARKER_BODY_ENDED, MARKER_BODY_PENDING, MARKER_NO_BODY};
use crank_gateway::protocol::Frame;
use crank_gateway::proxy::{Gateway, Listeners};
use crank_gateway::{GatewayConfig, HttpServer, Shutdown};

pub type ConnectorSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    pub shutdown: Shutdown,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Config with a short connector wait so capacity failures are quick.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.router.connector_max_wait_ms = 50;
    config.router.idle_read_timeout_ms = 5_000;
    config
}

/// Start a gateway on an ephemeral port.
pub async fn start_gateway(config: GatewayConfig, listeners: Listeners) -> TestGateway {
    let gateway = Arc::new(Gateway::from_config(&config, listeners).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let server = HttpServer::new(gateway.clone());
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestGateway {
        addr,
        gateway,
        shutdown,
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Attempt a connector registration; the handshake status is returned on rejection.
pub async fn try_register(
    addr: SocketAddr,
    route: &str,
    protocol: Option<&str>,
) -> Result<ConnectorSocket, StatusCode> {
    let url = format!(
        "ws://{addr}/register/?route={route}&componentName=test-svc&connectorInstanceID=inst-1"
    );
    let mut request = url.into_client_request().unwrap();
    if let Some(protocol) = protocol {
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol).unwrap(),
        );
    }
    match connect_async(request).await {
        Ok((ws, _)) => Ok(ws),
        Err(WsError::Http(response)) => Err(response.status()),
        Err(e) => panic!("registration failed: {e}"),
    }
}

/// Register a connector and wait until the gateway has pooled it.
pub async fn register(gw: &TestGateway, route: &str, protocol: &str) -> ConnectorSocket {
    let v1_before = gw.gateway.v1_pool().idle_for(route);
    let v3_before = gw.gateway.v3_pool().idle_for(route);
    let ws = try_register(gw.addr, route, Some(protocol)).await.unwrap();
    wait_until(|| {
        gw.gateway.v1_pool().idle_for(route) > v1_before
            || gw.gateway.v3_pool().idle_for(route) > v3_before
    })
    .await;
    ws
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// What a v1 connector saw of one request.
#[derive(Debug, Default)]
pub struct V1Request {
    pub head: String,
    pub body: Vec<u8>,
}

impl V1Request {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    /// Header value by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }
}

/// Read one v1 request: the head text, then body frames up to the end marker.
pub async fn read_v1_request(ws: &mut ConnectorSocket) -> V1Request {
    let mut request = V1Request::default();
    let head = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text.as_str().to_string(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected request head, got {other:?}"),
        }
    };
    let has_body = head.ends_with(MARKER_BODY_PENDING);
    assert!(has_body || head.ends_with(MARKER_NO_BODY), "bad marker: {head}");
    request.head = head[..head.len() - 2].to_string();

    if has_body {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(chunk))) => request.body.extend_from_slice(&chunk),
                Some(Ok(Message::Text(text))) if text.as_str() == MARKER_BODY_ENDED => break,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected request body, got {other:?}"),
            }
        }
    }
    request
}

/// Answer a v1 request and close the socket normally.
pub async fn respond_v1(ws: &mut ConnectorSocket, head: &str, body: &[u8]) {
    ws.send(Message::Text(head.into())).await.unwrap();
    if !body.is_empty() {
        ws.send(Message::Binary(Bytes::copy_from_slice(body)))
            .await
            .unwrap();
    }
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    })))
    .await
    .unwrap();
    while let Some(Ok(_)) = ws.next().await {}
}

/// Next v3 frame from the gateway, skipping control messages.
pub async fn next_frame(ws: &mut ConnectorSocket) -> Frame {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Binary(bytes)))) => return Frame::decode(bytes).unwrap(),
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            other => panic!("expected a v3 frame, got {other:?}"),
        }
    }
}

/// Read HEADER frames until END_HEADERS; returns the stream id and head text.
pub async fn read_v3_head(ws: &mut ConnectorSocket) -> (u32, String, bool) {
    let mut text = String::new();
    loop {
        match next_frame(ws).await {
            Frame::Header {
                stream_id,
                end_stream,
                end_headers,
                payload,
            } => {
                text.push_str(std::str::from_utf8(&payload).unwrap());
                if end_headers {
                    return (stream_id, text, end_stream);
                }
            }
            Frame::WindowUpdate { .. } => continue,
            other => panic!("expected HEADER frame, got {other:?}"),
        }
    }
}

pub async fn send_frame(ws: &mut ConnectorSocket, frame: Frame) {
    ws.send(Message::Binary(frame.encode())).await.unwrap();
}
