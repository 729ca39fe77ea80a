//! Shared error taxonomy for the communication layer.

use thiserror::Error;

/// Top-level error type for the communication layer.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Bad, expired, or wrong-audience token, or a signature mismatch.
    /// Rejected by the receiver, never retried there.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Timeout, refused connection, or non-2xx response.
    /// Retried up to the message's attempt ceiling.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The target server id is not in the discovery cache.
    /// Fails immediately without consuming a retry.
    #[error("Target server not found: {0}")]
    TargetNotFound(String),

    /// An audit or job write failed. Logged by the owning component,
    /// never propagated into business logic.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The process is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LinkError {
    /// Whether the delivery queue should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}

/// Alias for Result with LinkError.
pub type LinkResult<T> = Result<T, LinkError>;
