//! Channel bridge between a connector WebSocket and its session.
//!
//! # Responsibilities
//! - Translate WebSocket messages into [`SocketEvent`]s
//! - Write [`Outbound`] messages to the WebSocket in order
//! - Keep idle connectors alive with pings
//! - Report exactly one terminal event (close or error) and stop
//! - Close sockets that flood an inbound channel nobody is reading

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::protocol::close_code;

/// Inbound channel depth per connector socket.
const INBOUND_CAPACITY: usize = 64;
/// Outbound channel depth per connector socket.
const OUTBOUND_CAPACITY: usize = 64;

/// Something the connector did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text { text: String, is_last: bool },
    Binary(Bytes),
    /// Peer closed; `code` is absent when the connection dropped without a close frame.
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

impl SocketEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SocketEvent::Closed { .. } | SocketEvent::Error(_))
    }
}

/// Something to send to the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

impl From<Outbound> for Message {
    fn from(value: Outbound) -> Self {
        match value {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Binary(bytes) => Message::Binary(bytes),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

/// Whether a session has started reading the inbound channel.
///
/// Until then a full inbound channel means the connector is talking to
/// nobody, and the pump closes the socket instead of waiting.
#[derive(Debug, Clone, Default)]
pub struct Attachment(Arc<AtomicBool>);

impl Attachment {
    pub fn attach(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Session-facing end of a connector socket.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<SocketEvent>,
    pub attachment: Attachment,
}

/// Transport-facing end of a connector socket.
#[derive(Debug)]
pub struct PeerLink {
    pub outbound: mpsc::Receiver<Outbound>,
    pub inbound: mpsc::Sender<SocketEvent>,
    pub attachment: Attachment,
}

impl SocketLink {
    pub fn pair() -> (SocketLink, PeerLink) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let attachment = Attachment::default();
        (
            SocketLink {
                outbound: out_tx,
                inbound: in_rx,
                attachment: attachment.clone(),
            },
            PeerLink {
                outbound: out_rx,
                inbound: in_tx,
                attachment,
            },
        )
    }
}

/// What to do with one inbound event.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// The session stopped listening.
    Gone,
    /// Channel full and no session attached.
    Overflow,
}

async fn deliver(
    inbound: &mpsc::Sender<SocketEvent>,
    attachment: &Attachment,
    event: SocketEvent,
) -> Delivery {
    match inbound.try_send(event) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Closed(_)) => Delivery::Gone,
        Err(TrySendError::Full(event)) => {
            if !attachment.is_attached() {
                return Delivery::Overflow;
            }
            match inbound.send(event).await {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Gone,
            }
        }
    }
}

/// Drive a connector WebSocket until either side ends it.
///
/// Returns the terminal event that was reported to the session.
pub async fn pump(ws: WebSocket, peer: PeerLink, ping_after: Option<Duration>) -> SocketEvent {
    let (mut sink, mut stream) = ws.split();
    let PeerLink {
        mut outbound,
        inbound,
        attachment,
    } = peer;
    let mut last_write = Instant::now();

    let terminal = loop {
        let ping_at = ping_after.map(|quiet| last_write + quiet);
        let ping_due = async {
            match ping_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            msg = stream.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => SocketEvent::Text {
                        text: text.as_str().to_owned(),
                        is_last: true,
                    },
                    Some(Ok(Message::Binary(bytes))) => SocketEvent::Binary(bytes),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(frame))) => match frame {
                        Some(frame) => SocketEvent::Closed {
                            code: Some(frame.code),
                            reason: frame.reason.as_str().to_owned(),
                        },
                        None => SocketEvent::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    },
                    Some(Err(e)) => SocketEvent::Error(e.to_string()),
                    None => SocketEvent::Closed {
                        code: None,
                        reason: "connection dropped".to_string(),
                    },
                };
                if event.is_terminal() {
                    break event;
                }
                match deliver(&inbound, &attachment, event).await {
                    Delivery::Delivered => {}
                    // Nobody is listening any more; the socket is finished.
                    Delivery::Gone => {
                        break SocketEvent::Closed {
                            code: Some(close_code::NORMAL),
                            reason: String::new(),
                        };
                    }
                    Delivery::Overflow => {
                        tracing::warn!("Connector flooded an idle socket, closing it");
                        let reason = "unsolicited messages on idle socket".to_string();
                        let _ = sink
                            .send(Outbound::Close {
                                code: close_code::PROTOCOL_ERROR,
                                reason: reason.clone(),
                            }.into())
                            .await;
                        break SocketEvent::Closed {
                            code: Some(close_code::PROTOCOL_ERROR),
                            reason,
                        };
                    }
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink.send(Outbound::Close { code, reason: reason.clone() }.into()).await;
                        break SocketEvent::Closed { code: Some(code), reason };
                    }
                    Some(msg) => {
                        if let Err(e) = sink.send(msg.into()).await {
                            break SocketEvent::Error(e.to_string());
                        }
                        last_write = Instant::now();
                    }
                    None => {
                        let _ = sink.send(Outbound::Close {
                            code: close_code::NORMAL,
                            reason: String::new(),
                        }.into()).await;
                        break SocketEvent::Closed { code: Some(close_code::NORMAL), reason: String::new() };
                    }
                }
            }
            _ = ping_due => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    break SocketEvent::Error(e.to_string());
                }
                last_write = Instant::now();
            }
        }
    };

    if attachment.is_attached() {
        let _ = inbound.send(terminal.clone()).await;
    } else {
        let _ = inbound.try_send(terminal.clone());
    }
    terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(SocketEvent::Error("boom".into()).is_terminal());
        assert!(SocketEvent::Closed {
            code: Some(1000),
            reason: String::new()
        }
        .is_terminal());
        assert!(!SocketEvent::Binary(Bytes::from_static(b"x")).is_terminal());
    }

    #[test]
    fn test_outbound_close_message() {
        let msg: Message = Outbound::Close {
            code: close_code::GOING_AWAY,
            reason: "shutting down".into(),
        }
        .into();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason.as_str(), "shutting down");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_channel_without_session_overflows() {
        let (mut link, peer) = SocketLink::pair();
        for i in 0..INBOUND_CAPACITY {
            let event = SocketEvent::Binary(Bytes::from(i.to_string()));
            assert_eq!(
                deliver(&peer.inbound, &peer.attachment, event).await,
                Delivery::Delivered
            );
        }
        let extra = SocketEvent::Binary(Bytes::from_static(b"extra"));
        assert_eq!(
            deliver(&peer.inbound, &peer.attachment, extra.clone()).await,
            Delivery::Overflow
        );

        // Once a session reads, a full channel is backpressure instead.
        link.attachment.attach();
        let reader = tokio::spawn(async move {
            let mut seen = 0;
            while link.inbound.recv().await.is_some() {
                seen += 1;
            }
            seen
        });
        assert_eq!(
            deliver(&peer.inbound, &peer.attachment, extra).await,
            Delivery::Delivered
        );
        drop(peer);
        assert_eq!(reader.await.unwrap(), INBOUND_CAPACITY + 1);
    }

    #[tokio::test]
    async fn test_closed_channel_is_gone() {
        let (link, peer) = SocketLink::pair();
        drop(link);
        let event = SocketEvent::Binary(Bytes::from_static(b"late"));
        assert_eq!(
            deliver(&peer.inbound, &peer.attachment, event).await,
            Delivery::Gone
        );
    }

    #[tokio::test]
    async fn test_link_pair_is_connected() {
        let (mut link, mut peer) = SocketLink::pair();
        link.outbound.send(Outbound::Text("hello".into())).await.unwrap();
        assert_eq!(peer.outbound.recv().await, Some(Outbound::Text("hello".into())));

        peer.inbound
            .send(SocketEvent::Binary(Bytes::from_static(b"body")))
            .await
            .unwrap();
        assert_eq!(
            link.inbound.recv().await,
            Some(SocketEvent::Binary(Bytes::from_static(b"body")))
        );
    }
}
