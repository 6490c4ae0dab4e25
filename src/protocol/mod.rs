//! Framing protocol types.
//!
//! The wire format is a fixed 8-byte header followed by exactly
//! `payload_len` bytes of payload. The header codec is pure; connection
//! state lives in `server::connection`.

pub mod header;
pub mod message;

pub use header::{FrameHeader, HEADER_LEN};
pub use message::Message;
