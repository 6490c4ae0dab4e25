//! Wire header codec.
//!
//! Every message starts with a fixed 8-byte header: the payload length in
//! the first four bytes and the message type identifier in the next four,
//! both little-endian. The server echoes the header verbatim as the
//! handshake acknowledgment before the client sends the payload.

/// Size of the wire header in bytes.
pub const HEADER_LEN: usize = 8;

/// Parsed form of the 8-byte wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of payload bytes that follow the acknowledgment.
    pub payload_len: u32,
    /// Identifier used to route the completed message to a handler.
    pub message_type: i32,
}

impl FrameHeader {
    /// Create a header for a message of `payload_len` bytes.
    pub fn new(payload_len: u32, message_type: i32) -> Self {
        Self {
            payload_len,
            message_type,
        }
    }

    /// Encode to the 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4..].copy_from_slice(&self.message_type.to_le_bytes());
        buf
    }

    /// Decode from the 8-byte wire form.
    ///
    /// Callers guarantee a full header; partial buffers never reach this
    /// point (the assembler accumulates to 8 bytes first).
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let message_type = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Self {
            payload_len,
            message_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let headers = [
            FrameHeader::new(0, 0),
            FrameHeader::new(10, 0),
            FrameHeader::new(u32::MAX, i32::MIN),
            FrameHeader::new(1, -1),
            FrameHeader::new(0xDEAD_BEEF, 42),
        ];

        for header in headers {
            assert_eq!(FrameHeader::decode(&header.encode()), header);
        }
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let header = FrameHeader::new(10, 0x0102_0304);
        let bytes = header.encode();

        assert_eq!(&bytes[..4], &[10, 0, 0, 0]);
        assert_eq!(&bytes[4..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_negative_message_type() {
        let header = FrameHeader::new(3, -2);
        let bytes = header.encode();

        assert_eq!(&bytes[4..], &[0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(FrameHeader::decode(&bytes).message_type, -2);
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(FrameHeader::new(5, 1), FrameHeader::new(5, 1));
        assert_ne!(FrameHeader::new(5, 1), FrameHeader::new(5, 2));
        assert_ne!(FrameHeader::new(5, 1), FrameHeader::new(6, 1));
    }
}
