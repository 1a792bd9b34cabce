//! Connector wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Client request head
//!     → headers.rs (request head text, hop-by-hop stripping)
//!     → v1.rs (text frame + marker)  or  v3.rs (HEADER frames on a stream)
//!     → connector socket
//!
//! Connector response
//!     → v1.rs text frames / v3.rs HEADER frames (accumulated)
//!     → headers.rs (status line + header block parse, stripping)
//!     → client response head
//! ```
//!
//! # Design Decisions
//! - Codecs are pure: no I/O, no session state
//! - Both protocol versions share one header text format

pub mod headers;
pub mod v1;
pub mod v3;

pub use headers::{parse_response_head, request_head_text, strip_hop_by_hop, HeadError, ResponseHead};
pub use v3::{Frame, FrameError};

/// WebSocket close codes used toward connectors.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}
