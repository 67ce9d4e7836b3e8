//! Error types for tcp-echo.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while constructing a listener.
///
/// Every variant is produced after any socket opened so far has been closed.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] io::Error),

    #[error("failed to set socket options: {0}")]
    SocketOption(#[source] io::Error),

    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),

    #[error("failed to bind: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),

    #[error("failed to spawn accept loop: {0}")]
    AcceptLoop(#[source] io::Error),
}

/// Errors surfaced by [`Server`](crate::server::Server).
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to start server: {0}")]
    Start(#[from] ListenerError),

    #[error("server already started")]
    AlreadyStarted,

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to close listener: {0}")]
    Close(#[source] io::Error),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Unknown server type: {0}")]
    UnknownServerType(String),

    #[error("Invalid duration for {field}: {value:?} ({reason})")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to open log file '{}': {source}", .path.display())]
    LogFile { path: PathBuf, source: io::Error },
}

/// Line framing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}
