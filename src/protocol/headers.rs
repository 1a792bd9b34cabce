//! Header text codec shared by both protocol versions.
//!
//! # Responsibilities
//! - Serialize a request line and header block as connector header text
//! - Accumulate response header text with a hard size bound
//! - Parse a status line and header block into a response head
//! - Strip hop-by-hop headers, including names listed in `Connection`
//!
//! # Format
//! ```text
//! GET /svc/hello HTTP/1.1\n
//! host:example.org\n
//! accept:*/*\n
//! ```
//! Responses use the same layout with a status line (`HTTP/1.1 200 OK`).

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;

/// Upper bound on accumulated header text per exchange or stream.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Headers meaningful only to a single connection.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Extra headers never passed from a connector to the client.
pub const RESPONSE_DENY: [&str; 1] = ["server"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeadError {
    #[error("empty header block")]
    Empty,

    #[error("malformed status line: {0}")]
    BadStatusLine(String),

    #[error("malformed header line: {0}")]
    BadHeader(String),

    #[error("headers too large (limit {limit} bytes)")]
    TooLarge { limit: usize },

    #[error("header text is not valid UTF-8")]
    Utf8,
}

/// Parsed connector response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Bounded buffer for header text arriving in fragments.
///
/// Fragments are concatenated as bytes and decoded once complete, so a
/// multi-byte character split across frames is reassembled intact.
#[derive(Debug)]
pub struct HeadBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for HeadBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_HEADER_BYTES)
    }
}

impl HeadBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, fragment: &[u8]) -> Result<(), HeadError> {
        if self.buf.len() + fragment.len() > self.limit {
            return Err(HeadError::TooLarge { limit: self.limit });
        }
        self.buf.extend_from_slice(fragment);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain the buffer and decode it.
    pub fn take_text(&mut self) -> Result<String, HeadError> {
        let bytes = std::mem::take(&mut self.buf);
        String::from_utf8(bytes).map_err(|_| HeadError::Utf8)
    }
}

/// Build connector header text for a request.
///
/// Non-UTF-8 header values are converted lossily.
pub fn request_head_text(method: &Method, target: &str, headers: &HeaderMap) -> String {
    let mut text = format!("{} {} HTTP/1.1\n", method, target);
    for (name, value) in headers {
        text.push_str(name.as_str());
        text.push(':');
        text.push_str(&String::from_utf8_lossy(value.as_bytes()));
        text.push('\n');
    }
    text
}

/// Parse connector header text into a status and a stripped header map.
pub fn parse_response_head(text: &str) -> Result<ResponseHead, HeadError> {
    let mut lines = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));

    let status_line = lines
        .by_ref()
        .find(|line| !line.trim().is_empty())
        .ok_or(HeadError::Empty)?;
    let status = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::BadHeader(line.to_string()))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HeadError::BadHeader(line.to_string()))?;
        let value = HeaderValue::from_bytes(value.trim().as_bytes())
            .map_err(|_| HeadError::BadHeader(line.to_string()))?;
        headers.append(name, value);
    }

    strip_hop_by_hop(&mut headers, true);
    Ok(ResponseHead { status, headers })
}

fn parse_status_line(line: &str) -> Result<StatusCode, HeadError> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(HeadError::BadStatusLine(line.to_string()));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| HeadError::BadStatusLine(line.to_string()))
}

/// Remove hop-by-hop headers in place.
///
/// Names listed in the `Connection` header are removed as well. With
/// `response` set, the response deny-list is applied too.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, response: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if response {
        for name in RESPONSE_DENY {
            headers.remove(name);
        }
    }
    for name in listed {
        headers.remove(name);
    }
}
