//! Protocol v1 request framing.
//!
//! A request goes out as one text frame: the header text followed by a
//! marker line saying whether body frames follow. When they do, the body
//! is sent as binary frames and terminated by a text frame holding only
//! the end-of-body marker.

use axum::http::{HeaderMap, Method};

use crate::protocol::headers::request_head_text;

/// Header text complete, body frames follow.
pub const MARKER_BODY_PENDING: &str = "_1";
/// Header text complete, no body.
pub const MARKER_NO_BODY: &str = "_2";
/// Request body complete.
pub const MARKER_BODY_ENDED: &str = "_3";

/// The text frame that opens a v1 request.
pub fn request_frame(method: &Method, target: &str, headers: &HeaderMap, has_body: bool) -> String {
    let mut text = request_head_text(method, target, headers);
    text.push_str(if has_body {
        MARKER_BODY_PENDING
    } else {
        MARKER_NO_BODY
    });
    text
}
