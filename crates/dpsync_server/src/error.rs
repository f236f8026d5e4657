//! Error types for the sync server.

use dpsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request from a subscriber.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Connection limit reached.
    #[error("too many connections (limit {0})")]
    TooManyConnections(usize),

    /// Framing or encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Server is shutting down.
    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns true if the subscriber caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::TooManyConnections(_)
        )
    }
}
