//! End-to-end tests for protocol v1 connectors.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use common::*;
use crank_gateway::proxy::{listener_fn, Listeners, ProxyEvent};

#[tokio::test]
async fn test_v1_get_round_trip() {
    let completions = Arc::new(Mutex::new(Vec::new()));
    let seen = completions.clone();
    let listeners = Listeners::new(vec![listener_fn(move |event| {
        if let ProxyEvent::Complete { info } = event {
            seen.lock().push(info.status);
        }
        Ok(())
    })]);
    let gw = start_gateway(test_config(), listeners).await;
    let mut connector = register(&gw, "orders", "cranker_1.0").await;

    let connector_task = tokio::spawn(async move {
        let request = read_v1_request(&mut connector).await;
        respond_v1(
            &mut connector,
            "HTTP/1.1 200 OK\ncontent-type:text/plain\nx-served-by:fake\n",
            b"hello from orders",
        )
        .await;
        request
    });

    let response = http_client()
        .get(gw.url("/orders/42?full=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-served-by"], "fake");
    assert_eq!(response.text().await.unwrap(), "hello from orders");

    let request = connector_task.await.unwrap();
    assert_eq!(request.request_line(), "GET /orders/42?full=true HTTP/1.1");
    assert!(request.header("via").unwrap().contains("muc"));
    assert!(request.header("forwarded").unwrap().contains("for=127.0.0.1"));

    wait_until(|| completions.lock().len() == 1).await;
    // The socket served its one exchange and is gone.
    wait_until(|| !gw.gateway.routes().contains("orders")).await;
}

#[tokio::test]
async fn test_v1_request_body_is_streamed() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let mut connector = register(&gw, "upload", "cranker_1.0").await;

    let connector_task = tokio::spawn(async move {
        let request = read_v1_request(&mut connector).await;
        respond_v1(&mut connector, "HTTP/1.1 201 Created\n", b"").await;
        request
    });

    let payload = vec![b'x'; 40_000];
    let response = http_client()
        .post(gw.url("/upload/files"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let request = connector_task.await.unwrap();
    assert!(request.request_line().starts_with("POST /upload/files"));
    assert_eq!(request.body, payload);
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_stripped() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let mut connector = register(&gw, "svc", "cranker_1.0").await;

    let connector_task = tokio::spawn(async move {
        let request = read_v1_request(&mut connector).await;
        respond_v1(
            &mut connector,
            "HTTP/1.1 200 OK\nproxy-authenticate:Basic\nserver:internal\nx-kept:yes\n",
            b"ok",
        )
        .await;
        request
    });

    let response = http_client()
        .get(gw.url("/svc/x"))
        .header("proxy-authorization", "Basic Zm9vOmJhcg==")
        .header("x-custom-hop", "secret")
        .header("connection", "x-custom-hop")
        .header("x-app", "kept")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("proxy-authenticate").is_none());
    assert!(response.headers().get("server").is_none());
    assert_eq!(response.headers()["x-kept"], "yes");

    let request = connector_task.await.unwrap();
    assert!(request.header("proxy-authorization").is_none());
    assert!(request.header("x-custom-hop").is_none());
    assert_eq!(request.header("x-app"), Some("kept"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let _connector = register(&gw, "known", "cranker_1.0").await;

    let response = http_client().get(gw.url("/unknown/x")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_catch_all_serves_unmatched_paths() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let mut connector = register(&gw, "*", "cranker_1.0").await;

    let connector_task = tokio::spawn(async move {
        let request = read_v1_request(&mut connector).await;
        respond_v1(&mut connector, "HTTP/1.1 200 OK\n", b"fallback").await;
        request
    });

    let response = http_client().get(gw.url("/anything/at/all")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "fallback");
    let request = connector_task.await.unwrap();
    assert!(request.request_line().starts_with("GET /anything/at/all"));
}

#[tokio::test]
async fn test_no_capacity_is_503_after_max_wait() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let mut connector = register(&gw, "busy", "cranker_1.0").await;

    // First request takes the only socket and is held open.
    let client = http_client();
    let first = {
        let client = client.clone();
        let url = gw.url("/busy/slow");
        tokio::spawn(async move { client.get(url).send().await })
    };
    let request = read_v1_request(&mut connector).await;
    assert!(request.request_line().starts_with("GET /busy/slow"));

    let started = Instant::now();
    let response = client.get(gw.url("/busy/other")).send().await.unwrap();
    let waited = started.elapsed();
    assert_eq!(response.status(), 503);
    assert!(waited >= Duration::from_millis(50), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1_500), "waited {waited:?}");

    respond_v1(&mut connector, "HTTP/1.1 200 OK\n", b"done").await;
    assert_eq!(first.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn test_connector_failure_before_head_is_502() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let mut connector = register(&gw, "flaky", "cranker_1.0").await;

    let connector_task = tokio::spawn(async move {
        let _ = read_v1_request(&mut connector).await;
        // Abort without a close frame.
        drop(connector);
    });

    let response = http_client().get(gw.url("/flaky/x")).send().await.unwrap();
    assert_eq!(response.status(), 502);
    connector_task.await.unwrap();
}

#[tokio::test]
async fn test_idle_connector_flooding_is_closed() {
    let gw = start_gateway(test_config(), Listeners::default()).await;
    let mut connector = register(&gw, "chatty", "cranker_1.0").await;

    for i in 0..100 {
        connector
            .send(Message::Text(format!("noise {i}").into()))
            .await
            .unwrap();
    }

    let close = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match connector.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(close.unwrap().code, CloseCode::Protocol);
    wait_until(|| !gw.gateway.routes().contains("chatty")).await;
}
