//! Server error types.

use std::io;
use thiserror::Error;

use shoal_protocol::{HandshakeError, ProtocolError};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, stream, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol error (framing, masking, etc.).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Upgrade handshake was rejected.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Upgrade request head exceeded the configured size cap.
    #[error("request head too large (max: {max} bytes)")]
    RequestHeadTooLarge { max: usize },

    /// Send attempted on a connection that is already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
