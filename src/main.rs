//! framed-server: a TCP server speaking a length-prefixed framing protocol.
//!
//! Thin host around the library: loads configuration, installs the tracing
//! subscriber, registers a demo handler for message type 0 that logs
//! inbound messages, and shuts down gracefully on ctrl-c.

use framed_server::{Config, DispatchRegistry, HandlerError, Message, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.server.host,
        port = config.server.port,
        max_connections = config.server.max_connections,
        "Starting framed-server"
    );

    let mut registry = DispatchRegistry::new();
    registry.register(0, log_message);

    serve(config, registry)
}

/// Demo handler: log each inbound message.
fn log_message(message: &Message) -> Result<(), HandlerError> {
    info!(
        peer = %message.peer,
        len = message.payload().len(),
        text = %String::from_utf8_lossy(message.payload()),
        "message received"
    );
    Ok(())
}

#[tokio::main]
async fn serve(config: Config, registry: DispatchRegistry) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config.server, registry)?;
    let handle = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            handle.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
