//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or framing messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Failed to encode a frame body.
    #[error("encoding failed: {message}")]
    Encode {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a frame body.
    #[error("decoding failed: {message}")]
    Decode {
        /// Description of the decoding error.
        message: String,
    },

    /// Declared frame length exceeds the allowed maximum.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A frame arrived that is not valid at this point of the exchange.
    #[error("unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame {
        /// Frame kind that was expected.
        expected: &'static str,
        /// Frame kind that was received.
        actual: &'static str,
    },

    /// I/O error on the underlying byte stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates an encoding error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Returns true if the peer closed the byte stream cleanly.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
