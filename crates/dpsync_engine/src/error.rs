//! Error types for the sync engine.

use dpsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to the remote sync service.
///
/// None of these escape [`SyncClient::run`](crate::SyncClient::run). They are
/// logged and recorded in the client stats. Retryable errors start another
/// connection attempt; anything else stops the client.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Could not establish a connection.
    #[error("failed to dial {target}: {message}")]
    Dial {
        /// Address that was dialled.
        target: String,
        /// Error message.
        message: String,
    },

    /// Connection was established but the subscription could not be opened.
    #[error("failed to open subscription: {0}")]
    Subscribe(String),

    /// The open stream broke while receiving.
    #[error("stream broken: {0}")]
    Stream(String),

    /// Framing or encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A statistics report could not be sent on the open stream.
    #[error("failed to report statistics: {0}")]
    Report(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} on {event}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Event that was applied.
        event: String,
    },
}

impl SyncError {
    /// Creates a dial error.
    pub fn dial(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dial {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Returns true if the reconnect loop should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Dial { .. }
                | SyncError::Subscribe(_)
                | SyncError::Stream(_)
                | SyncError::Report(_)
                | SyncError::Protocol(_)
                | SyncError::Io(_)
        )
    }
}
