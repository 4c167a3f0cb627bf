//! Error types shared across the broker workspace.

use {crate::identifier::NodeId, thiserror::Error};

/// Errors that can occur anywhere in the broker core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid or missing configuration at startup. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// A peer sent a semantically invalid request.
    #[error("bad request from peer: {0}")]
    BadRequest(String),

    /// A peer tried to open a session that already exists.
    #[error("duplicate session for {0}")]
    DuplicateSession(NodeId),

    /// A message arrived whose handler tag matches no registered callback.
    #[error("no handler registered for '{0}'")]
    UnhandledMessage(String),

    /// Datagram send/receive failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Outbound message exceeds the maximum datagram payload.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    Overflow {
        /// Actual encoded size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Convenience result type for broker operations.
pub type Result<T> = std::result::Result<T, CoreError>;
