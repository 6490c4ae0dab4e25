//! Completed message values handed to dispatch.

use crate::protocol::header::FrameHeader;
use bytes::Bytes;
use std::net::SocketAddr;

/// A fully assembled inbound message.
///
/// Ephemeral: constructed when the last payload byte arrives, handed to the
/// registered handler by reference, and dropped when dispatch returns. The
/// origin connection is identified by id and peer address; the header
/// acknowledgment is the connection's own job, so handlers never see the
/// socket.
#[derive(Debug, Clone)]
pub struct Message {
    /// Slot id of the originating connection in the server's active set.
    pub conn_id: usize,
    /// Peer address of the originating connection.
    pub peer: SocketAddr,
    /// The header that framed this message.
    pub header: FrameHeader,
    /// Exactly `header.payload_len` bytes of payload.
    pub payload: Bytes,
}

impl Message {
    /// The identifier this message is routed by.
    pub fn message_type(&self) -> i32 {
        self.header.message_type
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let msg = Message {
            conn_id: 3,
            peer: "127.0.0.1:9000".parse().unwrap(),
            header: FrameHeader::new(5, 7),
            payload: Bytes::from_static(b"hello"),
        };

        assert_eq!(msg.message_type(), 7);
        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.header.payload_len as usize, msg.payload().len());
    }
}
