//! Message dispatch.
//!
//! Completed messages are routed to handlers by their message-type
//! identifier. The registry is populated before the server starts and is
//! immutable afterwards; handler failures stop at the dispatch boundary.

use crate::protocol::Message;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, trace};

/// Error type handlers may return. Logged at the dispatch boundary.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business-logic capability invoked for one message type.
///
/// Handlers run on the originating connection's task, so a slow handler
/// stalls only its own connection.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// The registered handler accepted the message.
    Handled,
    /// The handler returned an error or panicked; already logged.
    HandlerFailed,
    /// No handler is registered for this message type.
    Unregistered,
}

/// Static mapping from message-type identifier to handler.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<i32, Box<dyn MessageHandler>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register<H>(&mut self, message_type: i32, handler: H) -> &mut Self
    where
        H: MessageHandler + 'static,
    {
        self.handlers.insert(message_type, Box::new(handler));
        self
    }

    /// Whether a handler is registered for `message_type`.
    pub fn is_registered(&self, message_type: i32) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route `message` to its handler.
    ///
    /// Handler errors and panics are contained here; they must never take
    /// the server down.
    pub(crate) fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&message.message_type()) else {
            return DispatchOutcome::Unregistered;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
            Ok(Ok(())) => {
                trace!(
                    message_type = message.message_type(),
                    len = message.payload().len(),
                    "message handled"
                );
                DispatchOutcome::Handled
            }
            Ok(Err(e)) => {
                error!(
                    message_type = message.message_type(),
                    conn_id = message.conn_id,
                    error = %e,
                    "handler failed"
                );
                DispatchOutcome::HandlerFailed
            }
            Err(_) => {
                error!(
                    message_type = message.message_type(),
                    conn_id = message.conn_id,
                    "handler panicked"
                );
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameHeader;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn message(message_type: i32, payload: &'static [u8]) -> Message {
        Message {
            conn_id: 0,
            peer: "127.0.0.1:1".parse().unwrap(),
            header: FrameHeader::new(payload.len() as u32, message_type),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_registered_handler_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut registry = DispatchRegistry::new();
        registry.register(7, move |message: &Message| -> Result<(), HandlerError> {
            assert_eq!(message.payload(), b"abc");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(registry.is_registered(7));
        assert_eq!(
            registry.dispatch(&message(7, b"abc")),
            DispatchOutcome::Handled
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_type_is_explicit() {
        let registry = DispatchRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.dispatch(&message(42, b"")),
            DispatchOutcome::Unregistered
        );
    }

    #[test]
    fn test_handler_error_is_contained() {
        let mut registry = DispatchRegistry::new();
        registry.register(1, |_: &Message| -> Result<(), HandlerError> {
            Err("business failure".into())
        });

        assert_eq!(
            registry.dispatch(&message(1, b"x")),
            DispatchOutcome::HandlerFailed
        );
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let mut registry = DispatchRegistry::new();
        registry.register(2, |_: &Message| -> Result<(), HandlerError> {
            panic!("handler bug")
        });

        assert_eq!(
            registry.dispatch(&message(2, b"x")),
            DispatchOutcome::HandlerFailed
        );
    }

    #[test]
    fn test_register_replaces_previous_handler() {
        let mut registry = DispatchRegistry::new();
        registry.register(3, |_: &Message| -> Result<(), HandlerError> {
            Err("old".into())
        });
        registry.register(3, |_: &Message| -> Result<(), HandlerError> { Ok(()) });

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.dispatch(&message(3, b"")),
            DispatchOutcome::Handled
        );
    }
}
