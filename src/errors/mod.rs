//! Domain-specific error types for the pub/sub connection pool
//!
//! This module provides structured error types using `thiserror` for
//! precise and ergonomic error handling throughout the crate.

use thiserror::Error;

/// Main error type for the pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// Configuration-related errors (CLI parsing, validation, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network transport errors (reset, handshake, I/O)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connect attempt or graceful close that did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Remote end (or proxy) refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Wire protocol violations (unexpected frames, bad envelopes)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// More topics than `max_connections * topics_per_connection` can hold
    #[error("Maximum topics limit has been reached: {unplaced} topic(s) left unplaced (limit {limit})")]
    CapacityExceeded { unplaced: usize, limit: usize },

    /// URL parsing errors
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
}

/// Result type using PoolError
pub type Result<T> = std::result::Result<T, PoolError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_config_context(self, msg: &str) -> Result<T>;
    fn with_transport_context(self, msg: &str) -> Result<T>;
    fn with_protocol_context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn with_config_context(self, msg: &str) -> Result<T> {
        self.map_err(|e| PoolError::Config(format!("{}: {}", msg, e)))
    }

    fn with_transport_context(self, msg: &str) -> Result<T> {
        self.map_err(|e| PoolError::Transport(format!("{}: {}", msg, e)))
    }

    fn with_protocol_context(self, msg: &str) -> Result<T> {
        self.map_err(|e| PoolError::Protocol(format!("{}: {}", msg, e)))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn with_config_context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| PoolError::Config(msg.to_string()))
    }

    fn with_transport_context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| PoolError::Transport(msg.to_string()))
    }

    fn with_protocol_context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| PoolError::Protocol(msg.to_string()))
    }
}

// Convenience constructors
impl PoolError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PoolError::Config(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        PoolError::Transport(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PoolError::Timeout(msg.into())
    }

    /// Whether a connect attempt failing with this error should simply be
    /// retried. A garbled reply from the remote end or a proxy is retried too;
    /// only errors no retry can change are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::Transport(_)
                | PoolError::Timeout(_)
                | PoolError::ConnectionRefused(_)
                | PoolError::Protocol(_)
                | PoolError::WebSocket(_)
        )
    }
}

// Custom From implementation for boxed WebSocket errors
impl From<tokio_tungstenite::tungstenite::Error> for PoolError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PoolError::WebSocket(Box::new(err))
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => PoolError::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => PoolError::Timeout(err.to_string()),
            _ => PoolError::Transport(err.to_string()),
        }
    }
}
