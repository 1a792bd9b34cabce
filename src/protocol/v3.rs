//! Protocol v3 binary frame codec.
//!
//! # Frame Layout
//! ```text
//! ┌──────────┬──────────┬────────────────────┬──────────────────┐
//! │ type (1) │ flags (1)│ stream id (4, BE)  │ payload ...      │
//! └──────────┴──────────┴────────────────────┴──────────────────┘
//!
//! DATA(0)           raw body bytes
//! HEADER(1)         UTF-8 header text fragment
//! RST_STREAM(3)     [error code:4][UTF-8 message]
//! WINDOW_UPDATE(8)  [credit delta:4]
//! ```
//!
//! # Design Decisions
//! - Header text larger than one fragment is split on byte boundaries;
//!   the receiver joins fragments as bytes before decoding
//! - Unknown message types surface as a distinct error so callers can
//!   log and drop the frame without failing the socket

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 6;

/// Largest HEADER fragment or DATA payload the gateway sends.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

pub const FLAG_END_STREAM: u8 = 0b0000_0001;
pub const FLAG_END_HEADERS: u8 = 0b0000_0100;

/// RST_STREAM error codes sent by the gateway.
pub mod reset_code {
    /// The client went away before the stream finished.
    pub const CLIENT_CLOSED: u32 = 1001;
    pub const PROTOCOL_ERROR: u32 = 1002;
    /// No progress within the idle-read timeout.
    pub const TIMEOUT: u32 = 1008;
    pub const INTERNAL_ERROR: u32 = 1011;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Data = 0,
    Header = 1,
    RstStream = 3,
    WindowUpdate = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Header),
            3 => Ok(MessageType::RstStream),
            8 => Ok(MessageType::WindowUpdate),
            other => Err(other),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown message type {kind} on stream {stream_id}")]
    UnknownType { kind: u8, stream_id: u32 },

    #[error("WINDOW_UPDATE payload must be 4 bytes, got {0}")]
    BadWindowUpdate(usize),

    #[error("RST_STREAM payload must be at least 4 bytes, got {0}")]
    BadRstStream(usize),

    #[error("RST_STREAM message is not valid UTF-8")]
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
    },
    Header {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        payload: Bytes,
    },
    RstStream {
        stream_id: u32,
        code: u32,
        message: String,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Header { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Data { .. } => MessageType::Data,
            Frame::Header { .. } => MessageType::Header,
            Frame::RstStream { .. } => MessageType::RstStream,
            Frame::WindowUpdate { .. } => MessageType::WindowUpdate,
        }
    }

    pub fn decode(bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }

        let mut buf = bytes;
        let kind = buf.get_u8();
        let flags = buf.get_u8();
        let stream_id = buf.get_u32();

        let kind = MessageType::try_from(kind)
            .map_err(|kind| FrameError::UnknownType { kind, stream_id })?;

        match kind {
            MessageType::Data => Ok(Frame::Data {
                stream_id,
                end_stream: flags & FLAG_END_STREAM != 0,
                payload: buf,
            }),
            MessageType::Header => Ok(Frame::Header {
                stream_id,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                payload: buf,
            }),
            MessageType::RstStream => {
                if buf.len() < 4 {
                    return Err(FrameError::BadRstStream(buf.len()));
                }
                let code = buf.get_u32();
                let message = String::from_utf8(buf.to_vec()).map_err(|_| FrameError::Utf8)?;
                Ok(Frame::RstStream {
                    stream_id,
                    code,
                    message,
                })
            }
            MessageType::WindowUpdate => {
                if buf.len() != 4 {
                    return Err(FrameError::BadWindowUpdate(buf.len()));
                }
                Ok(Frame::WindowUpdate {
                    stream_id,
                    delta: buf.get_u32(),
                })
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let (flags, payload_len) = match self {
            Frame::Data {
                end_stream,
                payload,
                ..
            } => (flag(*end_stream, FLAG_END_STREAM), payload.len()),
            Frame::Header {
                end_stream,
                end_headers,
                payload,
                ..
            } => (
                flag(*end_stream, FLAG_END_STREAM) | flag(*end_headers, FLAG_END_HEADERS),
                payload.len(),
            ),
            Frame::RstStream { message, .. } => (0, 4 + message.len()),
            Frame::WindowUpdate { .. } => (0, 4),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_u8(self.message_type() as u8);
        buf.put_u8(flags);
        buf.put_u32(self.stream_id());
        match self {
            Frame::Data { payload, .. } | Frame::Header { payload, .. } => {
                buf.put_slice(payload);
            }
            Frame::RstStream { code, message, .. } => {
                buf.put_u32(*code);
                buf.put_slice(message.as_bytes());
            }
            Frame::WindowUpdate { delta, .. } => buf.put_u32(*delta),
        }
        buf.freeze()
    }
}

fn flag(set: bool, bit: u8) -> u8 {
    if set {
        bit
    } else {
        0
    }
}

/// Split header text into HEADER frames no larger than [`MAX_FRAME_PAYLOAD`].
///
/// Only the last frame carries END_HEADERS, plus END_STREAM when the
/// request has no body.
pub fn header_frames(stream_id: u32, text: &str, end_stream: bool) -> Vec<Frame> {
    let bytes = Bytes::copy_from_slice(text.as_bytes());
    let count = bytes.len().div_ceil(MAX_FRAME_PAYLOAD).max(1);

    (0..count)
        .map(|i| {
            let start = i * MAX_FRAME_PAYLOAD;
            let end = (start + MAX_FRAME_PAYLOAD).min(bytes.len());
            let last = i + 1 == count;
            Frame::Header {
                stream_id,
                end_stream: last && end_stream,
                end_headers: last,
                payload: bytes.slice(start..end),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_frame() {
        let raw = Bytes::from_static(&[0, 1, 0, 0, 0, 7, b'h', b'i']);
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream_id: 7,
                end_stream: true,
                payload: Bytes::from_static(b"hi"),
            }
        );
    }

    #[test]
    fn test_header_flags_on_wire() {
        let frame = Frame::Header {
            stream_id: 0x0102_0304,
            end_stream: false,
            end_headers: true,
            payload: Bytes::from_static(b"HTTP/1.1 200 OK\n"),
        };
        let wire = frame.encode();
        assert_eq!(&wire[..HEADER_LEN], &[1, 4, 1, 2, 3, 4]);
        assert_eq!(Frame::decode(wire).unwrap(), frame);
    }

    #[test]
    fn test_rst_stream_layout() {
        let frame = Frame::RstStream {
            stream_id: 3,
            code: reset_code::CLIENT_CLOSED,
            message: "client gone".to_string(),
        };
        let wire = frame.encode();
        assert_eq!(wire[0], 3);
        assert_eq!(&wire[6..10], &1001u32.to_be_bytes());
        assert_eq!(&wire[10..], b"client gone");
        assert_eq!(Frame::decode(wire).unwrap(), frame);
    }

    #[test]
    fn test_window_update_layout() {
        let wire = Frame::WindowUpdate {
            stream_id: 9,
            delta: 1024,
        }
        .encode();
        assert_eq!(wire.as_ref(), &[8, 0, 0, 0, 0, 9, 0, 0, 4, 0]);
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(
            Frame::decode(Bytes::from_static(&[0, 0, 0])),
            Err(FrameError::TooShort(3))
        );
        assert_eq!(
            Frame::decode(Bytes::from_static(&[2, 0, 0, 0, 0, 5])),
            Err(FrameError::UnknownType {
                kind: 2,
                stream_id: 5
            })
        );
        assert_eq!(
            Frame::decode(Bytes::from_static(&[8, 0, 0, 0, 0, 1, 0, 1])),
            Err(FrameError::BadWindowUpdate(2))
        );
        assert_eq!(
            Frame::decode(Bytes::from_static(&[3, 0, 0, 0, 0, 1, 0])),
            Err(FrameError::BadRstStream(1))
        );
    }

    #[test]
    fn test_header_frames_split() {
        let text = "x".repeat(MAX_FRAME_PAYLOAD * 2 + 10);
        let frames = header_frames(5, &text, true);
        assert_eq!(frames.len(), 3);

        let mut joined = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let Frame::Header {
                stream_id,
                end_stream,
                end_headers,
                payload,
            } = frame
            else {
                panic!("expected header frame");
            };
            assert_eq!(*stream_id, 5);
            assert_eq!(*end_headers, i == 2);
            assert_eq!(*end_stream, i == 2);
            joined.extend_from_slice(payload);
        }
        assert_eq!(joined, text.as_bytes());
    }

    #[test]
    fn test_empty_header_text_still_one_frame() {
        let frames = header_frames(1, "", false);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            Frame::Header {
                end_headers: true,
                end_stream: false,
                ..
            }
        ));
    }
}
