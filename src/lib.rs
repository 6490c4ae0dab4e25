//! An embeddable TCP server base.
//!
//! Accepts inbound connections, speaks a small length-prefixed framing
//! protocol over each one, enforces a maximum-connection admission policy,
//! and routes completed messages to pluggable handlers keyed by a
//! message-type identifier. A building block for services that need a
//! custom binary protocol without a full RPC stack.
//!
//! Wire format: every message starts with an 8-byte little-endian header
//! (`payload_len: u32`, `message_type: i32`). The server echoes the header
//! back as an acknowledgment, the client then sends exactly `payload_len`
//! payload bytes, and the assembled message is dispatched to the handler
//! registered for its type. Connections are long-lived and carry many
//! messages.
//!
//! ```no_run
//! use framed_server::{DispatchRegistry, HandlerError, Message, Server, ServerConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), framed_server::ServerError> {
//! fn on_ping(message: &Message) -> Result<(), HandlerError> {
//!     println!("ping from {}", message.peer);
//!     Ok(())
//! }
//!
//! let mut registry = DispatchRegistry::new();
//! registry.register(0, on_ping);
//!
//! let server = Server::bind(ServerConfig::new(6555), registry)?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::{Config, ServerConfig};
pub use error::ServerError;
pub use protocol::{FrameHeader, Message, HEADER_LEN};
pub use server::{DispatchRegistry, HandlerError, MessageHandler, Server, ShutdownHandle};
