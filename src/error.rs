//! Error types for the relay server

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed for {addr}")]
    AuthenticationFailed { addr: SocketAddr },

    #[error("Backlog error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed input from a peer. The offending connection is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Line exceeds {limit} bytes without terminator")]
    LineTooLong { limit: usize },

    #[error("Invalid status line: {0:?}")]
    InvalidStatusLine(String),

    #[error("Invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("Invalid icy-metaint value: {0:?}")]
    InvalidMetaInterval(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request headers exceed {limit} bytes")]
    HeadersTooLarge { limit: usize },
}

/// Backlog buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// No valid frame at the front of the backlog. Only validated frames
    /// are ever appended, so this is an internal bug.
    #[error("No valid frame at backlog front ({used} bytes buffered)")]
    Exhausted { used: usize },

    #[error("Frame of {len} bytes exceeds backlog capacity of {capacity} bytes")]
    FrameTooLarge { len: usize, capacity: usize },
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Client cannot keep up with the stream")]
    SlowConsumer,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
