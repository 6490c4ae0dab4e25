//! Configuration module for the framed server.
//!
//! The library is configured through [`ServerConfig`]; the binary layers
//! command-line arguments over an optional TOML configuration file, with
//! CLI arguments taking precedence.

use crate::error::ServerError;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default admission ceiling.
pub const DEFAULT_MAX_CONNECTIONS: usize = 3;

/// Default body-read inactivity timeout in milliseconds.
pub const DEFAULT_BODY_TIMEOUT_MS: u64 = 30_000;

/// Default payload-size ceiling (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Server configuration.
///
/// Immutable once handed to [`Server::bind`](crate::server::Server::bind).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub host: String,
    /// Port to listen on. Port 0 binds an ephemeral port; the resolved
    /// address is available from `Server::local_addr`.
    pub port: u16,
    /// Admission ceiling. Must be at least 1.
    pub max_connections: usize,
    /// A connection that stops delivering body bytes for this long is
    /// closed and evicted.
    pub body_timeout: Duration,
    /// Headers announcing a payload larger than this close the connection
    /// before any allocation.
    pub max_payload_len: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            body_timeout: Duration::from_millis(DEFAULT_BODY_TIMEOUT_MS),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl ServerConfig {
    /// Configuration for a given port with defaults everywhere else.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Reject configurations the server must not start with.
    ///
    /// Called by `Server::bind` before any socket is opened.
    pub(crate) fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections < 1 {
            return Err(ServerError::Config(format!(
                "max_connections must be at least 1, got {}",
                self.max_connections
            )));
        }
        Ok(())
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command-line arguments for the server binary.
#[derive(Parser, Debug)]
#[command(name = "framed-server")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server speaking a length-prefixed framing protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrently admitted connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Body-read inactivity timeout in milliseconds
    #[arg(long)]
    pub body_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Admission ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Body-read inactivity timeout in milliseconds
    #[serde(default = "default_body_timeout_ms")]
    pub body_timeout_ms: u64,
    /// Payload-size ceiling in bytes
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            body_timeout_ms: default_body_timeout_ms(),
            max_payload_len: default_max_payload_len(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6555
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_body_timeout_ms() -> u64 {
    DEFAULT_BODY_TIMEOUT_MS
}

fn default_max_payload_len() -> u32 {
    DEFAULT_MAX_PAYLOAD_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration for the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ServerError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ServerError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|e| ServerError::ConfigFile {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&contents).map_err(|e| ServerError::ConfigParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        let server = ServerConfig {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            body_timeout: Duration::from_millis(
                cli.body_timeout_ms
                    .unwrap_or(toml_config.server.body_timeout_ms),
            ),
            max_payload_len: toml_config.server.max_payload_len,
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        Ok(Config { server, log_level })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.body_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 7000
            max_connections = 16
            body_timeout_ms = 5000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.body_timeout_ms, 5000);
        assert_eq!(config.server.max_payload_len, DEFAULT_MAX_PAYLOAD_LEN);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_toml_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 6555);
        assert_eq!(config.server.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.logging.level, "info");
    }
}
