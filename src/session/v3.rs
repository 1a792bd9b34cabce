//! Protocol v3 multiplexed sessions.
//!
//! # Responsibilities
//! - Assign stream ids and route inbound frames to their stream (demux)
//! - Drive one client exchange per stream over a shared socket
//! - Enforce outbound credit for request bodies, acknowledge response data
//! - Reset single streams on client disconnect, timeout or stream error
//! - Fail every open stream when the socket itself goes away
//!
//! # Data Flow
//! ```text
//!                       ┌────────────────────┐
//! connector frames ────▶│ run_demux (1/sock) │──▶ stream 1 ─▶ StreamSession ─▶ client A
//!                       │  Frame::decode     │──▶ stream 3 ─▶ StreamSession ─▶ client B
//!                       └────────────────────┘
//! StreamSession ──HEADER/DATA/RST/WINDOW_UPDATE──▶ shared outbound channel ──▶ connector
//! ```
//!
//! # Design Decisions
//! - Per-stream queues are unbounded; connector output is already bounded by
//!   the WINDOW_UPDATE credit each stream hands out
//! - The socket returns to the pool as soon as a stream's request head is
//!   written, so concurrent requests share it
//! - Frames for unknown stream ids are dropped: the stream may have finished

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::net::{Outbound, SocketEvent};
use crate::pool::{ConnectorPool, PooledSocket, SocketMeta};
use crate::protocol::headers::{parse_response_head, request_head_text, HeadBuffer, HeadError};
use crate::protocol::v3::{header_frames, reset_code, Frame, FrameError, MAX_FRAME_PAYLOAD};
use crate::proxy::error::ProxyError;
use crate::session::{ClientExchange, ExchangeContext, ProxyRequest};

/// What the demux hands to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Header {
        payload: Bytes,
        end_headers: bool,
        end_stream: bool,
    },
    Data {
        payload: Bytes,
        end_stream: bool,
    },
    Reset {
        code: u32,
        message: String,
    },
    WindowUpdate(u32),
    SocketClosed(String),
}

#[derive(Debug)]
struct StreamTable {
    next_id: u32,
    entries: HashMap<u32, mpsc::UnboundedSender<StreamEvent>>,
    closed: bool,
}

/// A connector socket speaking protocol v3.
#[derive(Debug)]
pub struct V3Socket {
    meta: SocketMeta,
    outbound: mpsc::Sender<Outbound>,
    streams: Mutex<StreamTable>,
}

impl V3Socket {
    pub fn new(meta: SocketMeta, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            meta,
            outbound,
            streams: Mutex::new(StreamTable {
                next_id: 1,
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocate a stream id unique among this socket's open streams.
    ///
    /// Returns `None` once the socket has failed.
    pub fn open_stream(&self) -> Option<(u32, mpsc::UnboundedReceiver<StreamEvent>)> {
        let mut table = self.streams.lock();
        if table.closed {
            return None;
        }
        let id = loop {
            let id = table.next_id;
            table.next_id = table.next_id.checked_add(1).unwrap_or(1);
            if !table.entries.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        table.entries.insert(id, tx);
        Some((id, rx))
    }

    pub fn close_stream(&self, stream_id: u32) {
        self.streams.lock().entries.remove(&stream_id);
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().entries.len()
    }

    /// Route one decoded frame to its stream.
    pub fn dispatch(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let event = match frame {
            Frame::Header {
                payload,
                end_headers,
                end_stream,
                ..
            } => StreamEvent::Header {
                payload,
                end_headers,
                end_stream,
            },
            Frame::Data {
                payload,
                end_stream,
                ..
            } => StreamEvent::Data {
                payload,
                end_stream,
            },
            Frame::RstStream { code, message, .. } => StreamEvent::Reset { code, message },
            Frame::WindowUpdate { delta, .. } => StreamEvent::WindowUpdate(delta),
        };

        let table = self.streams.lock();
        match table.entries.get(&stream_id) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                tracing::trace!(
                    socket_id = %self.meta.id,
                    stream_id,
                    "Dropping frame for unknown stream"
                );
            }
        }
    }

    /// Terminate every open stream; no new streams can be opened afterwards.
    pub fn fail_all(&self, reason: &str) {
        let entries = {
            let mut table = self.streams.lock();
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        for tx in entries.values() {
            let _ = tx.send(StreamEvent::SocketClosed(reason.to_string()));
        }
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), mpsc::error::SendError<Outbound>> {
        let bytes = frame.encode();
        let len = bytes.len();
        self.outbound.send(Outbound::Binary(bytes)).await?;
        self.meta.record_sent(len);
        Ok(())
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

impl PooledSocket for V3Socket {
    fn meta(&self) -> &SocketMeta {
        &self.meta
    }
}

/// Read a v3 socket's frames and fan them out to its streams until it ends.
///
/// When the socket ends, every open stream fails and the socket leaves the pool.
pub async fn run_demux(
    socket: Arc<V3Socket>,
    pool: Arc<ConnectorPool<V3Socket>>,
    mut inbound: mpsc::Receiver<SocketEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(SocketEvent::Binary(bytes)) => {
                socket.meta.record_received(bytes.len());
                match Frame::decode(bytes) {
                    Ok(frame) => socket.dispatch(frame),
                    Err(FrameError::UnknownType { kind, stream_id }) => {
                        tracing::debug!(
                            socket_id = %socket.meta.id,
                            kind,
                            stream_id,
                            "Dropping frame of unknown type"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            socket_id = %socket.meta.id,
                            route = %socket.meta.route,
                            error = %e,
                            "Dropping malformed frame"
                        );
                    }
                }
            }
            Some(SocketEvent::Text { .. }) => {
                tracing::debug!(socket_id = %socket.meta.id, "Ignoring text message on v3 socket");
            }
            Some(SocketEvent::Closed { code, reason }) => {
                break match code {
                    Some(code) => format!("connector socket closed ({code}) {reason}"),
                    None => "connector socket dropped".to_string(),
                };
            }
            Some(SocketEvent::Error(e)) => break format!("connector socket error: {e}"),
            None => break "connector socket dropped".to_string(),
        }
    };

    let open = socket.active_streams();
    socket.fail_all(&reason);
    if pool.remove(&socket) {
        tracing::info!(
            route = %socket.meta.route,
            socket_id = %socket.meta.id,
            open_streams = open,
            reason = %reason,
            "v3 connector socket removed"
        );
    }
}

/// One client exchange carried on a stream of a shared v3 socket.
pub struct StreamSession {
    socket: Arc<V3Socket>,
    pool: Arc<ConnectorPool<V3Socket>>,
    stream_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    ctx: ExchangeContext,
    client: ClientExchange,
    idle_timeout: Duration,
    /// Request body bytes the connector will still accept.
    credit: u64,
    head: HeadBuffer,
    /// Stream ended from the connector's side; no reset needed.
    terminal: bool,
    reset_sent: bool,
}

impl StreamSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<V3Socket>,
        pool: Arc<ConnectorPool<V3Socket>>,
        stream_id: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        mut ctx: ExchangeContext,
        client: ClientExchange,
        idle_timeout: Duration,
        initial_window: u32,
    ) -> Self {
        ctx.info_mut().stream_id = Some(stream_id);
        Self {
            socket,
            pool,
            stream_id,
            events,
            ctx,
            client,
            idle_timeout,
            credit: u64::from(initial_window),
            head: HeadBuffer::default(),
            terminal: false,
            reset_sent: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn credit(&self) -> u64 {
        self.credit
    }

    pub async fn run(mut self, request: ProxyRequest) {
        let result = self.exchange(request).await;
        self.finish(result).await;
    }

    async fn exchange(&mut self, request: ProxyRequest) -> Result<(), ProxyError> {
        let text = request_head_text(&request.method, &request.target, &request.headers);
        for frame in header_frames(self.stream_id, &text, !request.has_body) {
            self.send(&frame).await?;
        }
        // Other requests may use the socket from here on.
        self.pool.release(self.socket.clone());

        let mut body = request.body.into_data_stream();
        let mut body_done = !request.has_body;
        let mut pending: Option<Bytes> = None;
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            self.flush(&mut pending).await?;

            tokio::select! {
                chunk = body.next(), if !body_done && pending.is_none() => match chunk {
                    Some(Ok(bytes)) => {
                        if !bytes.is_empty() {
                            pending = Some(bytes);
                        }
                    }
                    Some(Err(_)) => return Err(ProxyError::ClientClosed),
                    None => {
                        self.send(&Frame::Data {
                            stream_id: self.stream_id,
                            end_stream: true,
                            payload: Bytes::new(),
                        })
                        .await?;
                        body_done = true;
                    }
                },
                event = self.events.recv() => {
                    deadline = Instant::now() + self.idle_timeout;
                    match event {
                        Some(StreamEvent::Header { payload, end_headers, end_stream }) => {
                            self.on_header(&payload, end_headers)?;
                            if end_stream {
                                return self.end_of_response();
                            }
                        }
                        Some(StreamEvent::Data { payload, end_stream }) => {
                            self.on_data(payload).await?;
                            if end_stream {
                                return self.end_of_response();
                            }
                        }
                        Some(StreamEvent::WindowUpdate(delta)) => {
                            self.credit = self.credit.saturating_add(u64::from(delta));
                        }
                        Some(StreamEvent::Reset { code, message }) => {
                            self.terminal = true;
                            if code == reset_code::TIMEOUT {
                                return Err(ProxyError::Timeout {
                                    route: self.ctx.route().to_string(),
                                });
                            }
                            return Err(self.upstream(format!(
                                "stream reset by connector ({code}): {message}"
                            )));
                        }
                        Some(StreamEvent::SocketClosed(reason)) => {
                            self.terminal = true;
                            return Err(self.upstream(reason));
                        }
                        None => {
                            self.terminal = true;
                            return Err(self.upstream("stream dropped by demux"));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ProxyError::Timeout { route: self.ctx.route().to_string() });
                }
                _ = self.client.closed() => return Err(ProxyError::ClientClosed),
            }
        }
    }

    /// Send as much of `pending` as the current credit allows.
    async fn flush(&mut self, pending: &mut Option<Bytes>) -> Result<(), ProxyError> {
        while let Some(chunk) = pending.take() {
            if self.credit == 0 {
                *pending = Some(chunk);
                break;
            }
            let allowed = usize::try_from(self.credit).unwrap_or(usize::MAX);
            let n = chunk.len().min(MAX_FRAME_PAYLOAD).min(allowed);
            let part = chunk.slice(..n);
            self.send(&Frame::Data {
                stream_id: self.stream_id,
                end_stream: false,
                payload: part.clone(),
            })
            .await?;
            self.credit -= n as u64;
            self.ctx.request_chunk_sent(&part);
            if n < chunk.len() {
                *pending = Some(chunk.slice(n..));
            }
        }
        Ok(())
    }

    fn on_header(&mut self, payload: &[u8], end_headers: bool) -> Result<(), ProxyError> {
        if self.client.head_sent() {
            tracing::debug!(
                route = %self.ctx.route(),
                stream_id = self.stream_id,
                "Ignoring HEADER frame after response head"
            );
            return Ok(());
        }
        self.head.push(payload).map_err(|e| self.head_error(e))?;
        if end_headers {
            self.commit_head()?;
        }
        Ok(())
    }

    async fn on_data(&mut self, payload: Bytes) -> Result<(), ProxyError> {
        if !self.client.head_sent() {
            return Err(self.protocol("DATA frame before response head"));
        }
        if payload.is_empty() {
            return Ok(());
        }

        let len = payload.len();
        self.ctx.response_chunk_received(&payload);
        self.client.send_body(payload).await?;
        self.ctx.response_chunk_written(len);
        self.send(&Frame::WindowUpdate {
            stream_id: self.stream_id,
            delta: len as u32,
        })
        .await
    }

    fn end_of_response(&mut self) -> Result<(), ProxyError> {
        self.terminal = true;
        if !self.client.head_sent() {
            if self.head.is_empty() {
                return Err(self.protocol("stream ended before response head"));
            }
            self.commit_head()?;
        }
        Ok(())
    }

    fn commit_head(&mut self) -> Result<(), ProxyError> {
        let text = self.head.take_text().map_err(|e| self.head_error(e))?;
        let head = parse_response_head(&text).map_err(|e| self.head_error(e))?;
        self.ctx
            .head_received(head.status, &head.headers)
            .map_err(ProxyError::Vetoed)?;
        self.client.send_head(head.status, head.headers)
    }

    /// Reset this stream toward the connector.
    ///
    /// Sends at most one RST_STREAM per stream, and none once the stream
    /// has ended from the connector's side. Returns true if a frame was sent.
    pub async fn reset(&mut self, code: u32, message: &str) -> bool {
        if self.terminal || self.reset_sent {
            return false;
        }
        self.reset_sent = true;
        let frame = Frame::RstStream {
            stream_id: self.stream_id,
            code,
            message: message.to_string(),
        };
        let _ = self.socket.send_frame(&frame).await;
        tracing::debug!(
            route = %self.ctx.route(),
            socket_id = %self.socket.meta.id,
            stream_id = self.stream_id,
            code,
            "Stream reset sent"
        );
        true
    }

    async fn finish(mut self, result: Result<(), ProxyError>) {
        match &result {
            Ok(()) => self.client.finish(),
            Err(error) => {
                self.client.fail(error);
                let code = match error {
                    ProxyError::ClientClosed => reset_code::CLIENT_CLOSED,
                    ProxyError::Timeout { .. } => reset_code::TIMEOUT,
                    ProxyError::Protocol { .. } | ProxyError::HeadersTooLarge { .. } => {
                        reset_code::PROTOCOL_ERROR
                    }
                    _ => reset_code::INTERNAL_ERROR,
                };
                self.reset(code, &error.to_string()).await;
                if error.is_upstream_fault() {
                    tracing::warn!(
                        route = %self.ctx.route(),
                        socket_id = %self.socket.meta.id,
                        stream_id = self.stream_id,
                        error = %error,
                        "v3 stream failed"
                    );
                }
            }
        }

        self.socket.close_stream(self.stream_id);
        self.ctx.complete(result.err());
    }

    async fn send(&self, frame: &Frame) -> Result<(), ProxyError> {
        self.socket
            .send_frame(frame)
            .await
            .map_err(|_| self.upstream("connector socket closed while sending"))
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

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("socket_id", &self.socket.meta.id)
            .field("stream_id", &self.stream_id)
            .field("credit", &self.credit)
            .field("terminal", &self.terminal)
            .field("reset_sent", &self.reset_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{PeerLink, SocketLink};
    use crate::pool::ProtocolVersion;
    use crate::protocol::headers::MAX_HEADER_BYTES;
    use crate::proxy::listener::ProxyInfo;
    use crate::routing::RouteTable;
    use crate::session::test_support::recording_listeners;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, Response, StatusCode, Uri};
    use tokio::sync::oneshot;

    type Completed = Arc<parking_lot::Mutex<Vec<ProxyInfo>>>;

    struct Connector {
        socket: Arc<V3Socket>,
        pool: Arc<ConnectorPool<V3Socket>>,
        peer: PeerLink,
    }

    fn connector() -> Connector {
        let pool = Arc::new(ConnectorPool::new(
            ProtocolVersion::V3,
            Arc::new(RouteTable::new()),
            Duration::from_millis(50),
        ));
        let (link, peer) = SocketLink::pair();
        let meta = SocketMeta::new(
            "svc",
            "svc-app",
            "instance-1",
            ProtocolVersion::V3,
            "127.0.0.1:40000".parse().unwrap(),
        );
        let socket = Arc::new(V3Socket::new(meta, link.outbound));
        pool.register(socket.clone());
        tokio::spawn(run_demux(socket.clone(), pool.clone(), link.inbound));
        Connector { socket, pool, peer }
    }

    fn session(
        c: &Connector,
        window: u32,
        idle: Duration,
    ) -> (StreamSession, oneshot::Receiver<Response<Body>>, Completed) {
        let (id, events) = c.socket.open_stream().unwrap();
        let (listeners, completed) = recording_listeners();
        let info = ProxyInfo::new(
            "svc",
            Method::GET,
            Uri::from_static("/svc/hello"),
            "127.0.0.1:5555".parse().unwrap(),
        );
        let ctx = ExchangeContext::new(info, std::time::Instant::now(), listeners);
        let (client, head_rx) = ClientExchange::new();
        let session = StreamSession::new(
            c.socket.clone(),
            c.pool.clone(),
            id,
            events,
            ctx,
            client,
            idle,
            window,
        );
        (session, head_rx, completed)
    }

    fn get() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            target: "/svc/hello".to_string(),
            headers: HeaderMap::new(),
            body: Body::empty(),
            has_body: false,
        }
    }

    async fn next_frame(peer: &mut PeerLink) -> Frame {
        match peer.outbound.recv().await {
            Some(Outbound::Binary(bytes)) => Frame::decode(bytes).unwrap(),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    async fn reply(peer: &PeerLink, frame: Frame) {
        peer.inbound
            .send(SocketEvent::Binary(frame.encode()))
            .await
            .unwrap();
    }

    fn head_frame(stream_id: u32, text: &str, end_stream: bool) -> Frame {
        Frame::Header {
            stream_id,
            end_stream,
            end_headers: true,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    fn data(stream_id: u32, payload: &'static [u8], end_stream: bool) -> Frame {
        Frame::Data {
            stream_id,
            end_stream,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_happy_path_acknowledges_data_and_keeps_socket() {
        let mut c = connector();
        let socket = c.pool.acquire("svc").await.unwrap();
        assert!(Arc::ptr_eq(&socket, &c.socket));
        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(5));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));

        match next_frame(&mut c.peer).await {
            Frame::Header {
                stream_id,
                end_stream,
                end_headers,
                payload,
            } => {
                assert_eq!(stream_id, id);
                assert!(end_stream && end_headers);
                assert_eq!(&payload[..], b"GET /svc/hello HTTP/1.1\n");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        reply(&c.peer, head_frame(id, "HTTP/1.1 200 OK\ntransfer-encoding:chunked\n", false)).await;
        reply(&c.peer, data(id, b"o", false)).await;
        reply(&c.peer, data(id, b"k", false)).await;
        reply(&c.peer, data(id, b"", true)).await;

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("transfer-encoding").is_none());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
        task.await.unwrap();

        for _ in 0..2 {
            assert_eq!(
                next_frame(&mut c.peer).await,
                Frame::WindowUpdate {
                    stream_id: id,
                    delta: 1
                }
            );
        }
        assert!(c.peer.outbound.try_recv().is_err());

        let completed = completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes_sent, 2);
        assert!(completed[0].error.is_none());
        assert_eq!(c.pool.idle_for("svc"), 1);
        assert_eq!(c.socket.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let mut c = connector();
        let (mut session, _head_rx, _completed) = session(&c, 65536, Duration::from_secs(5));

        assert!(session.reset(reset_code::CLIENT_CLOSED, "gone").await);
        assert!(!session.reset(reset_code::CLIENT_CLOSED, "gone").await);

        assert!(matches!(
            next_frame(&mut c.peer).await,
            Frame::RstStream {
                code: reset_code::CLIENT_CLOSED,
                ..
            }
        ));
        assert!(c.peer.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_of_one_stream_leaves_other_intact() {
        let mut c = connector();
        let (a, head_a, completed_a) = session(&c, 65536, Duration::from_secs(5));
        let (b, head_b, completed_b) = session(&c, 65536, Duration::from_secs(5));
        let (id_a, id_b) = (a.stream_id(), b.stream_id());
        assert_ne!(id_a, id_b);

        let task_a = tokio::spawn(a.run(get()));
        let task_b = tokio::spawn(b.run(get()));
        next_frame(&mut c.peer).await;
        next_frame(&mut c.peer).await;

        // Client A goes away.
        drop(head_a);
        task_a.await.unwrap();
        match next_frame(&mut c.peer).await {
            Frame::RstStream { stream_id, code, .. } => {
                assert_eq!(stream_id, id_a);
                assert_eq!(code, reset_code::CLIENT_CLOSED);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        reply(&c.peer, head_frame(id_b, "HTTP/1.1 200 OK\n", false)).await;
        reply(&c.peer, data(id_b, b"bee", true)).await;
        let response = head_b.await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"bee");
        task_b.await.unwrap();

        assert!(completed_a.lock()[0].error.as_ref().unwrap().is_client_side());
        let b_info = completed_b.lock()[0].clone();
        assert!(b_info.error.is_none());
        assert_eq!(b_info.bytes_sent, 3);
    }

    #[tokio::test]
    async fn test_request_body_waits_for_credit() {
        let mut c = connector();
        let (session, _head_rx, completed) = session(&c, 4, Duration::from_secs(5));
        let id = session.stream_id();
        let request = ProxyRequest {
            method: Method::POST,
            target: "/svc/upload".to_string(),
            headers: HeaderMap::new(),
            body: Body::from("abcdefgh"),
            has_body: true,
        };
        let task = tokio::spawn(session.run(request));

        assert!(matches!(
            next_frame(&mut c.peer).await,
            Frame::Header {
                end_stream: false,
                ..
            }
        ));
        assert_eq!(next_frame(&mut c.peer).await, data(id, b"abcd", false));
        tokio::task::yield_now().await;
        assert!(c.peer.outbound.try_recv().is_err());

        reply(
            &c.peer,
            Frame::WindowUpdate {
                stream_id: id,
                delta: 100,
            },
        )
        .await;
        assert_eq!(next_frame(&mut c.peer).await, data(id, b"efgh", false));
        assert_eq!(next_frame(&mut c.peer).await, data(id, b"", true));

        reply(&c.peer, head_frame(id, "HTTP/1.1 201 Created\n", true)).await;
        task.await.unwrap();
        assert_eq!(completed.lock()[0].bytes_received, 8);
    }

    #[tokio::test]
    async fn test_socket_close_fails_open_streams() {
        let mut c = connector();
        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(5));
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;

        c.peer
            .inbound
            .send(SocketEvent::Closed {
                code: Some(1011),
                reason: "crash".into(),
            })
            .await
            .unwrap();

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        task.await.unwrap();
        assert!(matches!(
            completed.lock()[0].error,
            Some(ProxyError::Upstream { .. })
        ));
        assert!(!c.pool.has_route("svc"));
        assert!(c.socket.open_stream().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_resets_stream_only() {
        let mut c = connector();
        let (session, head_rx, _completed) = session(&c, 65536, Duration::from_secs(3));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        task.await.unwrap();
        assert!(matches!(
            next_frame(&mut c.peer).await,
            Frame::RstStream { stream_id, code: reset_code::TIMEOUT, .. } if stream_id == id
        ));
        assert!(c.pool.has_route("svc"));
    }

    #[tokio::test]
    async fn test_head_split_across_header_frames() {
        let mut c = connector();
        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(5));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;

        let fragment = |text: &'static str, end_headers: bool| Frame::Header {
            stream_id: id,
            end_stream: false,
            end_headers,
            payload: Bytes::from_static(text.as_bytes()),
        };
        reply(&c.peer, fragment("HTTP/1.1 200 OK\ncontent-", false)).await;
        reply(&c.peer, fragment("type:text/plain\nx-par", false)).await;
        reply(&c.peer, fragment("t:3\n", true)).await;
        reply(&c.peer, data(id, b"joined", true)).await;

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers()["x-part"], "3");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"joined");
        task.await.unwrap();
        assert!(completed.lock()[0].error.is_none());
    }

    #[tokio::test]
    async fn test_oversized_head_fails_stream_not_socket() {
        let mut c = connector();
        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(5));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;

        let chunk = Bytes::from(vec![b'x'; MAX_HEADER_BYTES / 2 + 1]);
        for _ in 0..2 {
            reply(
                &c.peer,
                Frame::Header {
                    stream_id: id,
                    end_stream: false,
                    end_headers: false,
                    payload: chunk.clone(),
                },
            )
            .await;
        }

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        task.await.unwrap();
        assert!(matches!(
            completed.lock()[0].error,
            Some(ProxyError::HeadersTooLarge { .. })
        ));
        assert_eq!(c.pool.idle_for("svc"), 1);
        assert!(c.socket.open_stream().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_after_head_aborts_body() {
        let mut c = connector();
        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(3));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;

        reply(&c.peer, head_frame(id, "HTTP/1.1 200 OK\n", false)).await;
        reply(&c.peer, data(id, b"partial", false)).await;

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .is_err());
        task.await.unwrap();
        assert!(matches!(
            completed.lock()[0].error,
            Some(ProxyError::Timeout { .. })
        ));

        loop {
            match next_frame(&mut c.peer).await {
                Frame::WindowUpdate { .. } => continue,
                Frame::RstStream { stream_id, code, .. } => {
                    assert_eq!(stream_id, id);
                    assert_eq!(code, reset_code::TIMEOUT);
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(c.pool.has_route("svc"));
    }

    #[tokio::test]
    async fn test_connector_timeout_reset_is_gateway_timeout() {
        let mut c = connector();
        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(5));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;

        reply(
            &c.peer,
            Frame::RstStream {
                stream_id: id,
                code: reset_code::TIMEOUT,
                message: "target timed out".to_string(),
            },
        )
        .await;

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        task.await.unwrap();
        assert!(matches!(
            completed.lock()[0].error,
            Some(ProxyError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_kill_the_socket() {
        let mut c = connector();
        // Unknown message type 7, then a frame shorter than its header.
        c.peer
            .inbound
            .send(SocketEvent::Binary(Bytes::from_static(&[7, 0, 0, 0, 0, 1, 0xAA])))
            .await
            .unwrap();
        c.peer
            .inbound
            .send(SocketEvent::Binary(Bytes::from_static(&[1, 4])))
            .await
            .unwrap();

        let (session, head_rx, completed) = session(&c, 65536, Duration::from_secs(5));
        let id = session.stream_id();
        let task = tokio::spawn(session.run(get()));
        next_frame(&mut c.peer).await;
        reply(&c.peer, head_frame(id, "HTTP/1.1 204 No Content\n", true)).await;

        let response = head_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        task.await.unwrap();
        assert!(completed.lock()[0].error.is_none());
        assert!(c.pool.has_route("svc"));
        assert_eq!(c.pool.idle_for("svc"), 1);
    }

    #[tokio::test]
    async fn test_frames_for_unknown_streams_are_dropped() {
        let c = connector();
        c.socket.dispatch(data(999, b"stray", false));
        c.socket.dispatch(Frame::RstStream {
            stream_id: 42,
            code: 1,
            message: String::new(),
        });
        assert_eq!(c.socket.active_streams(), 0);
        assert!(c.socket.open_stream().is_some());
    }
}
