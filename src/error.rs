//! Error types for server construction and startup.
//!
//! Only configuration and bind failures are fatal to the server as a whole.
//! Everything that goes wrong on an individual socket is connection-scoped
//! and handled inside `server::connection` — the affected connection is
//! closed and the server keeps running.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Rejected configuration. Raised before any socket is opened.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The listening endpoint could not be bound (at startup, or when
    /// resuming from the throttled state).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A configuration file could not be parsed.
    #[error("failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// I/O failure outside any single connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
