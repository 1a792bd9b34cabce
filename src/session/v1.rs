//! Protocol v1 exchange session.
//!
//! # Responsibilities
//! - Drive one borrowed socket through exactly one request/response exchange
//! - Stream the request body as binary frames, ending with the end-of-body marker
//! - Accumulate response header text (bounded) and commit it to the client
//! - Forward response body frames until the connector closes the socket
//! - Discard the socket afterwards, whatever the outcome
//!
//! # States
//! ```text
//! AwaitingConnectorReady ──request head written──▶ HeadersSent
//! HeadersSent ──response head committed──▶ StreamingBody
//! StreamingBody ──close 1000──▶ Completed
//! any ──error / timeout / client gone──▶ Faulted
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::net::{Attachment, Outbound, SocketEvent, SocketLink};
use crate::pool::{ConnectorPool, PooledSocket, SocketMeta};
use crate::protocol::close_code;
use crate::protocol::headers::{parse_response_head, HeadBuffer, HeadError};
use crate::protocol::v1::{request_frame, MARKER_BODY_ENDED};
use crate::proxy::error::ProxyError;
use crate::session::{ClientExchange, ExchangeContext, ProxyRequest};

/// A connector socket speaking protocol v1.
#[derive(Debug)]
pub struct V1Socket {
    meta: SocketMeta,
    outbound: mpsc::Sender<Outbound>,
    inbound: Mutex<Option<mpsc::Receiver<SocketEvent>>>,
    attachment: Attachment,
    has_response: AtomicBool,
}

impl V1Socket {
    pub fn new(meta: SocketMeta, link: SocketLink) -> Self {
        Self {
            meta,
            outbound: link.outbound,
            inbound: Mutex::new(Some(link.inbound)),
            attachment: link.attachment,
            has_response: AtomicBool::new(false),
        }
    }

    /// Take the event stream; only the first exchange gets it.
    fn take_inbound(&self) -> Option<mpsc::Receiver<SocketEvent>> {
        let inbound = self.inbound.lock().take();
        if inbound.is_some() {
            self.attachment.attach();
        }
        inbound
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

impl PooledSocket for V1Socket {
    fn meta(&self) -> &SocketMeta {
        &self.meta
    }

    fn has_response(&self) -> bool {
        self.has_response.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingConnectorReady,
    HeadersSent,
    StreamingBody,
    Completed,
    Faulted,
}

/// One request/response exchange over a borrowed v1 socket.
pub struct ExchangeSession {
    socket: Arc<V1Socket>,
    pool: Arc<ConnectorPool<V1Socket>>,
    ctx: ExchangeContext,
    client: ClientExchange,
    idle_timeout: Duration,
    state: ExchangeState,
    head: HeadBuffer,
}

impl ExchangeSession {
    pub fn new(
        socket: Arc<V1Socket>,
        pool: Arc<ConnectorPool<V1Socket>>,
        ctx: ExchangeContext,
        client: ClientExchange,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            pool,
            ctx,
            client,
            idle_timeout,
            state: ExchangeState::AwaitingConnectorReady,
            head: HeadBuffer::default(),
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Run the exchange to completion, then discard the socket.
    pub async fn run(mut self, request: ProxyRequest) {
        let result = self.exchange(request).await;
        self.finish(result).await;
    }

    async fn exchange(&mut self, request: ProxyRequest) -> Result<(), ProxyError> {
        let mut inbound = self
            .socket
            .take_inbound()
            .ok_or_else(|| self.upstream("socket was already used for an exchange"))?;
        self.socket.has_response.store(true, Ordering::Release);

        let frame = request_frame(
            &request.method,
            &request.target,
            &request.headers,
            request.has_body,
        );
        self.send(Outbound::Text(frame)).await?;
        self.state = ExchangeState::HeadersSent;

        let mut body = request.body.into_data_stream();
        let mut body_done = !request.has_body;
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                chunk = body.next(), if !body_done => match chunk {
                    Some(Ok(bytes)) => {
                        if !bytes.is_empty() {
                            self.send(Outbound::Binary(bytes.clone())).await?;
                            self.socket.meta.record_sent(bytes.len());
                            self.ctx.request_chunk_sent(&bytes);
                        }
                    }
                    Some(Err(_)) => return Err(ProxyError::ClientClosed),
                    None => {
                        self.send(Outbound::Text(MARKER_BODY_ENDED.to_string())).await?;
                        body_done = true;
                    }
                },
                event = inbound.recv() => {
                    deadline = Instant::now() + self.idle_timeout;
                    match event {
                        Some(SocketEvent::Text { text, is_last }) => self.on_text(&text, is_last)?,
                        Some(SocketEvent::Binary(bytes)) => self.on_binary(bytes).await?,
                        Some(SocketEvent::Closed { code, reason }) => return self.on_closed(code, &reason),
                        Some(SocketEvent::Error(error)) => return Err(self.upstream(error)),
                        None => return Err(self.upstream("connector socket dropped")),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ProxyError::Timeout { route: self.ctx.route().to_string() });
                }
                _ = self.client.closed() => return Err(ProxyError::ClientClosed),
            }
        }
    }

    fn on_text(&mut self, text: &str, is_last: bool) -> Result<(), ProxyError> {
        if self.state == ExchangeState::StreamingBody {
            tracing::debug!(route = %self.ctx.route(), "Ignoring text frame after response head");
            return Ok(());
        }
        self.head.push(text.as_bytes()).map_err(|e| self.head_error(e))?;
        if is_last {
            self.commit_head()?;
        }
        Ok(())
    }

    async fn on_binary(&mut self, bytes: Bytes) -> Result<(), ProxyError> {
        if self.state != ExchangeState::StreamingBody {
            if self.head.is_empty() {
                return Err(self.protocol("body frame before response head"));
            }
            self.commit_head()?;
        }

        let len = bytes.len();
        self.socket.meta.record_received(len);
        self.ctx.response_chunk_received(&bytes);
        self.client.send_body(bytes).await?;
        self.ctx.response_chunk_written(len);
        Ok(())
    }

    fn on_closed(&mut self, code: Option<u16>, reason: &str) -> Result<(), ProxyError> {
        match code {
            Some(close_code::NORMAL) if self.state == ExchangeState::StreamingBody => Ok(()),
            Some(close_code::NORMAL) if !self.head.is_empty() => self.commit_head(),
            Some(close_code::NORMAL) => Err(self.upstream("connector closed before sending a response")),
            // The connector gave up waiting on its own target.
            Some(close_code::POLICY_VIOLATION) => Err(ProxyError::Timeout {
                route: self.ctx.route().to_string(),
            }),
            Some(code) => Err(self.upstream(format!("connector closed with code {code}: {reason}"))),
            None => Err(self.upstream("connector disconnected without a close frame")),
        }
    }

    fn commit_head(&mut self) -> Result<(), ProxyError> {
        let text = self.head.take_text().map_err(|e| self.head_error(e))?;
        let head = parse_response_head(&text).map_err(|e| self.head_error(e))?;
        self.ctx
            .head_received(head.status, &head.headers)
            .map_err(ProxyError::Vetoed)?;
        self.client.send_head(head.status, head.headers)?;
        self.state = ExchangeState::StreamingBody;
        Ok(())
    }

    async fn send(&self, message: Outbound) -> Result<(), ProxyError> {
        self.socket
            .outbound
            .send(message)
            .await
            .map_err(|_| self.upstream("connector socket closed while sending"))
    }

    async fn finish(mut self, result: Result<(), ProxyError>) {
        let close = match &result {
            Ok(()) => {
                self.state = ExchangeState::Completed;
                self.client.finish();
                close_code::NORMAL
            }
            Err(error) => {
                self.state = ExchangeState::Faulted;
                self.client.fail(error);
                if error.is_upstream_fault() {
                    self.socket.meta.set_error(error.to_string());
                    tracing::warn!(
                        route = %self.ctx.route(),
                        socket_id = %self.socket.meta.id,
                        error = %error,
                        "v1 exchange failed"
                    );
                    close_code::INTERNAL_ERROR
                } else {
                    tracing::debug!(
                        route = %self.ctx.route(),
                        socket_id = %self.socket.meta.id,
                        error = %error,
                        "v1 exchange ended early"
                    );
                    close_code::GOING_AWAY
                }
            }
        };

        self.socket.has_response.store(false, Ordering::Release);
        self.socket.close(close, "").await;
        self.pool.remove(&self.socket);
        self.ctx.complete(result.err());
    }

    fn upstream(&self, detail: impl Into<String>) -> ProxyError {
        ProxyError::Upstream {
            route: self.ctx.route().to_string(),
            detail: detail.into(),
        }
    }

    fn protocol(&self, detail: impl Into<String>) -> ProxyError {
        ProxyError::Protocol {
            route: self.ctx.route().to_string(),
            detail: detail.into(),
        }
    }

    fn head_error(&self, error: HeadError) -> ProxyError {
        match error {
            HeadError::TooLarge { limit } => ProxyError::HeadersTooLarge {
                route: self.ctx.route().to_string(),
                limit,
            },
            other => self.protocol(other.to_string()),
        }
    }
}

impl std::fmt::Debug for ExchangeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSession")
            .field("socket_id", &self.socket.meta.id)
            .field("route", &self.ctx.route())
            .field("state", &self.state)
            .finish()
    }
}
