//! TCP server core: admission control and the multiplexing loop.
//!
//! The server owns the listening socket and the set of live connections.
//! Each admitted connection runs on its own task; termination is reported
//! back over a channel, and only the server loop mutates the active set.
//!
//! Admission is a two-state machine. While `Listening` the active count is
//! below the ceiling and the listener is open; admitting the connection
//! that reaches the ceiling drops the listener (`Throttled`), so the OS
//! refuses further attempts outright. The first eviction below the ceiling
//! re-binds the listener on the same address.

mod connection;
mod dispatch;

pub use dispatch::{DispatchRegistry, HandlerError, MessageHandler};

use crate::config::ServerConfig;
use crate::error::ServerError;
use connection::Connection;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const LISTEN_BACKLOG: i32 = 1024;

/// Notifications from connection tasks back to the server loop.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Closed { conn_id: usize },
}

/// Admission state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmissionState {
    /// Below the ceiling; accepting.
    Listening,
    /// At the ceiling; the listener is dropped until a slot frees up.
    Throttled,
}

/// Bookkeeping the server keeps per live connection. The connection itself
/// is owned by its task.
struct ConnHandle {
    peer: SocketAddr,
    join: JoinHandle<()>,
}

/// Requests an orderly server shutdown.
///
/// Cloneable, idempotent, and safe to trigger from any task or thread; the
/// run loop observes it within one iteration.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The server instance.
pub struct Server {
    config: ServerConfig,
    registry: Arc<DispatchRegistry>,
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Server {
    /// Validate `config` and bind the listening endpoint.
    ///
    /// Configuration is rejected before any socket is opened; a bind
    /// failure fails server startup entirely.
    pub fn bind(config: ServerConfig, registry: DispatchRegistry) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = bind_listener(&config.bind_addr())?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            registry: Arc::new(registry),
            listener,
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Serve until shutdown is requested.
    ///
    /// On exit — requested or fatal — the listener is closed, every
    /// connection is terminated, and their tasks are awaited.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            config,
            registry,
            listener,
            local_addr,
            shutdown,
        } = self;

        let listener = TcpListener::from_std(listener)?;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let mut mux = Multiplexer {
            config,
            registry,
            local_addr,
            listener: Some(listener),
            state: AdmissionState::Listening,
            connections: Slab::new(),
            shutdown,
            event_tx,
        };

        info!(
            addr = %mux.local_addr,
            max_connections = mux.config.max_connections,
            "server listening"
        );

        let result = mux.serve(&mut event_rx).await;
        mux.drain().await;
        info!("server stopped");
        result
    }
}

/// The run loop's working state. Single-writer: nothing else touches the
/// connection slab or the admission state.
struct Multiplexer {
    config: ServerConfig,
    registry: Arc<DispatchRegistry>,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    state: AdmissionState,
    connections: Slab<ConnHandle>,
    shutdown: CancellationToken,
    event_tx: mpsc::UnboundedSender<ConnEvent>,
}

impl Multiplexer {
    async fn serve(
        &mut self,
        event_rx: &mut mpsc::UnboundedReceiver<ConnEvent>,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                accepted = Self::accept(&self.listener) => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    // Transient (EMFILE and friends); the server must
                    // outlive it.
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
                Some(event) = event_rx.recv() => self.apply(event)?,
            }
        }
    }

    /// Accept on the listener, or park while throttled.
    async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
        match listener {
            Some(listener) => listener.accept().await,
            None => std::future::pending().await,
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        // One ack per header; Nagle would delay every handshake.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }

        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();
        let conn = Connection::new(conn_id, stream, peer, &self.config);
        let join = tokio::spawn(conn.run(
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.event_tx.clone(),
        ));
        entry.insert(ConnHandle { peer, join });

        info!(
            conn_id,
            peer = %peer,
            active = self.connections.len(),
            "connection admitted"
        );

        if self.connections.len() >= self.config.max_connections {
            self.pause();
        }
    }

    fn apply(&mut self, event: ConnEvent) -> Result<(), ServerError> {
        match event {
            ConnEvent::Closed { conn_id } => {
                if self.connections.contains(conn_id) {
                    let handle = self.connections.remove(conn_id);
                    debug!(
                        conn_id,
                        peer = %handle.peer,
                        active = self.connections.len(),
                        "connection evicted"
                    );
                }

                if self.state == AdmissionState::Throttled
                    && self.connections.len() < self.config.max_connections
                {
                    self.resume()?;
                }
                Ok(())
            }
        }
    }

    fn pause(&mut self) {
        if self.state == AdmissionState::Throttled {
            return;
        }
        self.state = AdmissionState::Throttled;
        // Dropping the listener closes it; the OS now refuses connection
        // attempts instead of queueing them.
        self.listener = None;
        info!(
            active = self.connections.len(),
            "connection threshold reached, listener paused"
        );
    }

    /// Re-open the listening endpoint after falling below the ceiling.
    ///
    /// A re-bind failure is fatal, like the startup bind.
    fn resume(&mut self) -> Result<(), ServerError> {
        let addr = self.local_addr.to_string();
        let std_listener = bind_listener(&addr)?;
        let listener = TcpListener::from_std(std_listener).map_err(|source| ServerError::Bind {
            addr,
            source,
        })?;

        self.listener = Some(listener);
        self.state = AdmissionState::Listening;
        info!(
            addr = %self.local_addr,
            active = self.connections.len(),
            "listener resumed"
        );
        Ok(())
    }

    /// Close everything and wait for connection tasks to finish.
    async fn drain(mut self) {
        self.listener = None;
        self.shutdown.cancel();

        let handles: Vec<ConnHandle> = self.connections.drain().collect();
        for handle in handles {
            if let Err(e) = handle.join.await {
                if e.is_panic() {
                    error!(peer = %handle.peer, "connection task panicked");
                }
            }
        }
    }
}

/// Build the listening socket.
fn bind_listener(addr: &str) -> Result<std::net::TcpListener, ServerError> {
    let sock_addr: SocketAddr = addr
        .parse()
        .map_err(|e| ServerError::Config(format!("invalid bind address '{addr}': {e}")))?;

    let bind_err = |source: io::Error| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = socket2::Socket::new(
        match sock_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(bind_err)?;

    // SO_REUSEADDR lets a throttled server re-bind its address immediately
    // when admission resumes.
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&sock_addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_max_connections_fails_before_binding() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };

        match Server::bind(config, DispatchRegistry::new()) {
            Err(ServerError::Config(msg)) => assert!(msg.contains("max_connections")),
            Err(other) => panic!("expected configuration error, got {other}"),
            Ok(_) => panic!("expected configuration error"),
        }
    }

    #[test]
    fn test_bind_resolves_ephemeral_port() {
        let server = Server::bind(ServerConfig::default(), DispatchRegistry::new()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_invalid_host_is_a_config_error() {
        let config = ServerConfig {
            host: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(config, DispatchRegistry::new()),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_shutdown_handle_is_idempotent() {
        let server = Server::bind(ServerConfig::default(), DispatchRegistry::new()).unwrap();
        let handle = server.shutdown_handle();

        assert!(!handle.is_shutdown());
        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shutdown());
    }
}
