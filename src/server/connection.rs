//! Per-socket connection state machine.
//!
//! Framing is split from I/O: [`FrameAssembler`] is a pure state machine
//! that accumulates header and body bytes and says what to do next, and
//! [`Connection`] drives it against the socket. The cycle on every
//! connection is header → acknowledgment → body → dispatch → header;
//! connections are long-lived and carry many messages.

use crate::config::ServerConfig;
use crate::protocol::{FrameHeader, Message, HEADER_LEN};
use crate::server::dispatch::{DispatchOutcome, DispatchRegistry};
use crate::server::ConnEvent;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Framing phase of a connection.
///
/// Advances Header → Body → Header, cyclically, never skipping.
enum Phase {
    /// Accumulating the 8-byte wire header.
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    /// Accumulating exactly `header.payload_len` body bytes.
    Body {
        header: FrameHeader,
        buf: BytesMut,
        filled: usize,
    },
}

/// What the assembler produced after accounting for freshly read bytes.
#[derive(Debug)]
pub(crate) enum Progress {
    /// The header completed. `ack` is the identical raw bytes and must be
    /// echoed to the peer before the body arrives.
    Header {
        header: FrameHeader,
        ack: [u8; HEADER_LEN],
    },
    /// The body completed; the assembler has reset to the header phase.
    Message { header: FrameHeader, payload: Bytes },
}

/// Header announcing a payload above the configured ceiling.
///
/// Detected before any body allocation and before the acknowledgment.
#[derive(Debug, Error)]
#[error("announced payload of {len} bytes exceeds the {max}-byte ceiling")]
pub(crate) struct OversizedPayload {
    pub len: u32,
    pub max: u32,
}

/// Pure framing state machine.
///
/// Callers read socket bytes into [`spare`](Self::spare) and report the
/// count via [`advance`](Self::advance). The assembler owns the invariant
/// that the body buffer length always equals the current header's
/// `payload_len`.
pub(crate) struct FrameAssembler {
    phase: Phase,
    max_payload_len: u32,
}

impl FrameAssembler {
    pub(crate) fn new(max_payload_len: u32) -> Self {
        Self {
            phase: Phase::Header {
                buf: [0; HEADER_LEN],
                filled: 0,
            },
            max_payload_len,
        }
    }

    /// Whether the assembler is waiting on body bytes.
    pub(crate) fn receiving_body(&self) -> bool {
        matches!(self.phase, Phase::Body { .. })
    }

    /// The unfilled region of the current phase's buffer.
    pub(crate) fn spare(&mut self) -> &mut [u8] {
        match &mut self.phase {
            Phase::Header { buf, filled } => &mut buf[*filled..],
            Phase::Body { buf, filled, .. } => &mut buf[*filled..],
        }
    }

    /// Account for `n` bytes just read into [`spare`](Self::spare).
    ///
    /// Partial fills are normal: TCP delivers a byte stream, not message
    /// boundaries, so a header or body may take many reads to complete.
    pub(crate) fn advance(&mut self, n: usize) -> Result<Option<Progress>, OversizedPayload> {
        match &mut self.phase {
            Phase::Header { buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= HEADER_LEN);
                if *filled < HEADER_LEN {
                    return Ok(None);
                }

                let header = FrameHeader::decode(buf);
                let ack = *buf;
                if header.payload_len > self.max_payload_len {
                    return Err(OversizedPayload {
                        len: header.payload_len,
                        max: self.max_payload_len,
                    });
                }

                let mut body = BytesMut::with_capacity(header.payload_len as usize);
                body.resize(header.payload_len as usize, 0);
                self.phase = Phase::Body {
                    header,
                    buf: body,
                    filled: 0,
                };
                Ok(Some(Progress::Header { header, ack }))
            }
            Phase::Body { filled, .. } => {
                *filled += n;
                Ok(self
                    .take_ready()
                    .map(|(header, payload)| Progress::Message { header, payload }))
            }
        }
    }

    /// Produce the message if the body is complete, resetting to the
    /// header phase. Zero-length payloads complete here without any body
    /// read.
    pub(crate) fn take_ready(&mut self) -> Option<(FrameHeader, Bytes)> {
        match &mut self.phase {
            Phase::Body {
                header,
                buf,
                filled,
            } if *filled == buf.len() => {
                let header = *header;
                let payload = std::mem::take(buf).freeze();
                self.phase = Phase::Header {
                    buf: [0; HEADER_LEN],
                    filled: 0,
                };
                Some((header, payload))
            }
            _ => None,
        }
    }
}

/// Outcome of a single [`Connection::step`].
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// More bytes are needed; call `step` again.
    Pending,
    /// A complete message was assembled.
    Message(Message),
    /// The peer closed the connection between messages.
    PeerClosed,
}

/// Connection-scoped failures. All of them close only this connection.
#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("no body bytes within {0:?}")]
    BodyTimeout(Duration),

    #[error("peer closed mid-message")]
    UnexpectedEof,

    #[error(transparent)]
    Oversized(#[from] OversizedPayload),
}

/// A live client connection, owned by its task.
pub(crate) struct Connection {
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
    assembler: FrameAssembler,
    body_timeout: Duration,
    terminated: bool,
}

impl Connection {
    pub(crate) fn new(id: usize, stream: TcpStream, peer: SocketAddr, config: &ServerConfig) -> Self {
        Self {
            id,
            stream,
            peer,
            assembler: FrameAssembler::new(config.max_payload_len),
            body_timeout: config.body_timeout,
            terminated: false,
        }
    }

    /// Drive the connection until it terminates, then report back.
    pub(crate) async fn run(
        mut self,
        registry: Arc<DispatchRegistry>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) {
        info!(conn_id = self.id, peer = %self.peer, "connection established");

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(conn_id = self.id, "connection cancelled");
                    break;
                }
                res = self.step() => res,
            };

            match outcome {
                Ok(StepOutcome::Pending) => {}
                Ok(StepOutcome::Message(message)) => {
                    match registry.dispatch(&message) {
                        // A failed handler got a well-formed message; the
                        // connection itself is healthy and stays open.
                        DispatchOutcome::Handled | DispatchOutcome::HandlerFailed => {}
                        DispatchOutcome::Unregistered => {
                            warn!(
                                conn_id = self.id,
                                message_type = message.message_type(),
                                "no handler registered, closing connection"
                            );
                            break;
                        }
                    }
                }
                Ok(StepOutcome::PeerClosed) => {
                    info!(conn_id = self.id, peer = %self.peer, "peer disconnected");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = self.id, peer = %self.peer, error = %e, "closing connection");
                    break;
                }
            }
        }

        self.close().await;
        // The receiver only drops once the server loop is past eviction.
        let _ = events.send(ConnEvent::Closed { conn_id: self.id });
    }

    /// One cooperative unit of work: a single read, plus the acknowledgment
    /// write when it completes the header.
    async fn step(&mut self) -> Result<StepOutcome, ConnectionError> {
        let receiving_body = self.assembler.receiving_body();

        let n = if receiving_body {
            // A peer that stalls mid-body would otherwise hold its
            // admission slot forever.
            match time::timeout(self.body_timeout, self.stream.read(self.assembler.spare())).await
            {
                Ok(res) => res?,
                Err(_) => return Err(ConnectionError::BodyTimeout(self.body_timeout)),
            }
        } else {
            // Between messages a connection may sit idle indefinitely;
            // cancellation bounds this wait.
            self.stream.read(self.assembler.spare()).await?
        };

        if n == 0 {
            return if receiving_body {
                Err(ConnectionError::UnexpectedEof)
            } else {
                Ok(StepOutcome::PeerClosed)
            };
        }

        match self.assembler.advance(n)? {
            None => Ok(StepOutcome::Pending),
            Some(Progress::Header { header, ack }) => {
                debug!(
                    conn_id = self.id,
                    payload_len = header.payload_len,
                    message_type = header.message_type,
                    "header received, sending acknowledgment"
                );
                self.stream.write_all(&ack).await?;

                match self.assembler.take_ready() {
                    Some((header, payload)) => Ok(StepOutcome::Message(self.assemble(header, payload))),
                    None => Ok(StepOutcome::Pending),
                }
            }
            Some(Progress::Message { header, payload }) => {
                debug!(conn_id = self.id, "complete message received");
                Ok(StepOutcome::Message(self.assemble(header, payload)))
            }
        }
    }

    fn assemble(&self, header: FrameHeader, payload: Bytes) -> Message {
        Message {
            conn_id: self.id,
            peer: self.peer,
            header,
            payload,
        }
    }

    /// Orderly two-way shutdown. Idempotent.
    async fn close(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let Err(e) = self.stream.shutdown().await {
            debug!(conn_id = self.id, error = %e, "socket shutdown failed");
        }
        info!(conn_id = self.id, peer = %self.peer, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Copy `bytes` into the assembler the way the socket driver would,
    /// collecting everything it produces.
    fn feed(asm: &mut FrameAssembler, mut bytes: &[u8]) -> Vec<Progress> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let spare = asm.spare();
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if let Some(progress) = asm.advance(n).unwrap() {
                out.push(progress);
            }
        }
        out
    }

    #[test]
    fn test_header_accumulates_across_partial_reads() {
        let mut asm = FrameAssembler::new(1024);
        let wire = FrameHeader::new(4, 7).encode();

        assert!(feed(&mut asm, &wire[..3]).is_empty());
        assert!(!asm.receiving_body());

        let progress = feed(&mut asm, &wire[3..]);
        match progress.as_slice() {
            [Progress::Header { header, ack }] => {
                assert_eq!(*header, FrameHeader::new(4, 7));
                assert_eq!(ack, &wire);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(asm.receiving_body());
    }

    #[test]
    fn test_body_accumulates_and_resets() {
        let mut asm = FrameAssembler::new(1024);
        let wire = FrameHeader::new(10, 0).encode();

        feed(&mut asm, &wire);
        assert!(feed(&mut asm, b"TestS").is_empty());

        let progress = feed(&mut asm, b"tring");
        match progress.as_slice() {
            [Progress::Message { header, payload }] => {
                assert_eq!(header.payload_len, 10);
                assert_eq!(payload.as_ref(), b"TestString");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Ready for the next message on the same connection.
        assert!(!asm.receiving_body());
        let next = feed(&mut asm, &FrameHeader::new(1, 2).encode());
        assert!(matches!(next.as_slice(), [Progress::Header { .. }]));
    }

    #[test]
    fn test_header_and_body_in_one_read() {
        let mut asm = FrameAssembler::new(1024);
        let mut wire = FrameHeader::new(3, 5).encode().to_vec();
        wire.extend_from_slice(b"abc");

        let progress = feed(&mut asm, &wire);
        assert_eq!(progress.len(), 2);
        assert!(matches!(progress[0], Progress::Header { .. }));
        match &progress[1] {
            Progress::Message { payload, .. } => assert_eq!(payload.as_ref(), b"abc"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_zero_length_payload_completes_after_header() {
        let mut asm = FrameAssembler::new(1024);
        let wire = FrameHeader::new(0, 9).encode();

        let progress = feed(&mut asm, &wire);
        assert!(matches!(progress.as_slice(), [Progress::Header { .. }]));

        let (header, payload) = asm.take_ready().unwrap();
        assert_eq!(header.message_type, 9);
        assert!(payload.is_empty());
        assert!(!asm.receiving_body());
    }

    #[test]
    fn test_take_ready_is_none_while_body_incomplete() {
        let mut asm = FrameAssembler::new(1024);
        feed(&mut asm, &FrameHeader::new(2, 0).encode());
        feed(&mut asm, b"x");
        assert!(asm.take_ready().is_none());
    }

    #[test]
    fn test_oversized_header_rejected_before_allocation() {
        let mut asm = FrameAssembler::new(16);
        let wire = FrameHeader::new(17, 0).encode();

        let spare = asm.spare();
        spare[..HEADER_LEN].copy_from_slice(&wire);
        let err = asm.advance(HEADER_LEN).unwrap_err();
        assert_eq!(err.len, 17);
        assert_eq!(err.max, 16);
    }

    #[test]
    fn test_body_buffer_sized_to_payload_len() {
        let mut asm = FrameAssembler::new(1024);
        feed(&mut asm, &FrameHeader::new(5, 0).encode());
        assert_eq!(asm.spare().len(), 5);
    }
}
