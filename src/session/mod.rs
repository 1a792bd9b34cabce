//! Exchange sessions over borrowed connector sockets.
//!
//! # Data Flow
//! ```text
//! Gateway::handle
//!     → acquire socket (pool)
//!     → v1.rs ExchangeSession   (one exchange, socket discarded after)
//!       v3.rs StreamSession     (one stream on a shared socket)
//!     → ClientExchange          (response head + streamed body to axum)
//!     → ExchangeContext         (counters, listener events, one completion)
//! ```
//!
//! # Design Decisions
//! - Each session runs on its own task; the handler only awaits the head
//! - The response body is a bounded channel, so a slow client slows the
//!   connector instead of growing a buffer
//! - Completion is fired from exactly one place, and from `Drop` if a
//!   session is torn down without finishing

pub mod v1;
pub mod v3;

use std::io;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Response, StatusCode};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::proxy::error::ProxyError;
use crate::proxy::listener::{EarlyResponse, Listeners, ProxyEvent, ProxyInfo};

pub use v1::{ExchangeSession, V1Socket};
pub use v3::{run_demux, StreamSession, V3Socket};

/// Response body chunks buffered between a session and the client.
const BODY_CHANNEL_CAPACITY: usize = 16;

type BodyItem = Result<Bytes, io::Error>;

/// A translated request ready to be sent to a connector.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query as received.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub has_body: bool,
}

/// The client side of one exchange.
#[derive(Debug)]
pub struct ClientExchange {
    head: Option<oneshot::Sender<Response<Body>>>,
    body: Option<mpsc::Sender<BodyItem>>,
}

impl ClientExchange {
    pub fn new() -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                head: Some(tx),
                body: None,
            },
            rx,
        )
    }

    /// Whether status and headers have been committed to the client.
    pub fn head_sent(&self) -> bool {
        self.head.is_none()
    }

    /// Commit status and headers; body chunks may follow.
    pub fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), ProxyError> {
        let head = self.head.take().ok_or(ProxyError::ClientClosed)?;
        let (tx, rx) = mpsc::channel::<BodyItem>(BODY_CHANNEL_CAPACITY);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        head.send(response).map_err(|_| ProxyError::ClientClosed)?;
        self.body = Some(tx);
        Ok(())
    }

    pub async fn send_body(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        match &self.body {
            Some(tx) => tx.send(Ok(chunk)).await.map_err(|_| ProxyError::ClientClosed),
            None => Err(ProxyError::ClientClosed),
        }
    }

    /// End the response body cleanly.
    pub fn finish(&mut self) {
        self.body = None;
    }

    /// Respond with a complete response in place of the connector's.
    ///
    /// Returns false if the head was already committed.
    pub fn respond(&mut self, response: Response<Body>) -> bool {
        match self.head.take() {
            Some(head) => {
                let _ = head.send(response);
                true
            }
            None => false,
        }
    }

    /// Report `error` to the client.
    ///
    /// Before the head is committed this sends the HTML error page;
    /// afterwards it aborts the response stream so the client sees a
    /// truncated response rather than a clean end.
    pub fn fail(&mut self, error: &ProxyError) {
        if self.respond(error.to_response()) {
            return;
        }
        if let Some(tx) = self.body.take() {
            let abort = io::Error::other(error.to_string());
            if let Err(mpsc::error::TrySendError::Full(item)) = tx.try_send(Err(abort)) {
                tokio::spawn(async move {
                    let _ = tx.send(item).await;
                });
            }
        }
    }

    /// Resolves once the client has gone away.
    pub async fn closed(&mut self) {
        if let Some(head) = self.head.as_mut() {
            head.closed().await;
        } else if let Some(body) = &self.body {
            body.closed().await;
        } else {
            std::future::pending::<()>().await;
        }
    }
}

/// Counters and listener plumbing for one exchange.
#[derive(Debug)]
pub struct ExchangeContext {
    info: ProxyInfo,
    started: Instant,
    listeners: Listeners,
    completed: bool,
}

impl ExchangeContext {
    pub fn new(info: ProxyInfo, started: Instant, listeners: Listeners) -> Self {
        Self {
            info,
            started,
            listeners,
            completed: false,
        }
    }

    pub fn info(&self) -> &ProxyInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut ProxyInfo {
        &mut self.info
    }

    pub fn route(&self) -> &str {
        &self.info.route
    }

    pub fn request_chunk_sent(&mut self, chunk: &Bytes) {
        self.info.bytes_received += chunk.len() as u64;
        let _ = self.listeners.fire(&ProxyEvent::RequestBodyChunkSent {
            info: &self.info,
            chunk,
        });
    }

    pub fn response_chunk_received(&mut self, chunk: &Bytes) {
        let _ = self.listeners.fire(&ProxyEvent::ResponseBodyChunkReceived {
            info: &self.info,
            chunk,
        });
    }

    pub fn response_chunk_written(&mut self, len: usize) {
        self.info.bytes_sent += len as u64;
    }

    /// Fire the head events; a veto replaces the connector's response.
    pub fn head_received(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<(), EarlyResponse> {
        let _ = self.listeners.fire(&ProxyEvent::AfterTargetHeadersReceived {
            info: &self.info,
            status,
            headers,
        });
        self.listeners.fire(&ProxyEvent::BeforeRespondingToClient {
            info: &self.info,
            status,
            headers,
        })?;
        self.info.status = Some(status);
        Ok(())
    }

    /// Fire the single completion for this exchange.
    pub fn complete(mut self, error: Option<ProxyError>) {
        self.finish(error);
    }

    fn finish(&mut self, error: Option<ProxyError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.info.duration = self.started.elapsed();

        if let Some(error) = &error {
            // A failure after the head keeps the committed status.
            self.info.status.get_or_insert(error.status());
            let _ = self.listeners.fire(&ProxyEvent::Error {
                info: &self.info,
                error,
            });
        }
        self.info.error = error;

        tracing::debug!(
            route = %self.info.route,
            method = %self.info.method,
            status = ?self.info.status.map(|s| s.as_u16()),
            duration_ms = self.info.duration.as_millis() as u64,
            bytes_sent = self.info.bytes_sent,
            bytes_received = self.info.bytes_received,
            error = ?self.info.error.as_ref().map(|e| e.to_string()),
            "Exchange complete"
        );
        let _ = self.listeners.fire(&ProxyEvent::Complete { info: &self.info });
    }
}

impl Drop for ExchangeContext {
    /// An exchange dropped without an outcome had its handler future
    /// cancelled, which only happens when the client goes away.
    fn drop(&mut self) {
        if !self.completed {
            self.finish(Some(ProxyError::ClientClosed));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Uri;
    use test_support::recording_listeners;

    fn info() -> ProxyInfo {
        ProxyInfo::new(
            "svc",
            Method::GET,
            Uri::from_static("/svc/x"),
            "127.0.0.1:5000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_client_exchange_streams_body() {
        let (mut client, head_rx) = ClientExchange::new();
        client.send_head(StatusCode::OK, HeaderMap::new()).unwrap();
        assert!(client.head_sent());

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let writer = tokio::spawn(async move {
            client.send_body(Bytes::from_static(b"he")).await.unwrap();
            client.send_body(Bytes::from_static(b"llo")).await.unwrap();
            client.finish();
        });
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_fail_before_head_sends_error_page() {
        let (mut client, head_rx) = ClientExchange::new();
        client.fail(&ProxyError::Timeout { route: "svc".into() });
        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_fail_after_head_aborts_body() {
        let (mut client, head_rx) = ClientExchange::new();
        client.send_head(StatusCode::OK, HeaderMap::new()).unwrap();
        client.send_body(Bytes::from_static(b"partial")).await.unwrap();
        client.fail(&ProxyError::Timeout { route: "svc".into() });

        let response = head_rx.await.unwrap();
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_when_client_drops() {
        let (mut client, head_rx) = ClientExchange::new();
        drop(head_rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(client
            .send_head(StatusCode::OK, HeaderMap::new())
            .is_err());
    }

    #[test]
    fn test_completion_fires_once() {
        let (listeners, completed) = recording_listeners();
        let mut ctx = ExchangeContext::new(info(), Instant::now(), listeners);
        ctx.response_chunk_written(2);
        ctx.complete(None);

        let completed = completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes_sent, 2);
        assert!(completed[0].error.is_none());
    }

    #[test]
    fn test_dropped_context_still_completes() {
        let (listeners, completed) = recording_listeners();
        drop(ExchangeContext::new(info(), Instant::now(), listeners));

        let completed = completed.lock();
        assert_eq!(completed.len(), 1);
        let error = completed[0].error.as_ref().unwrap();
        assert!(error.is_client_side());
        assert!(!error.is_upstream_fault());
    }
}
