//! Protocol error types.

use msnp_core::ObjectError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding frames and bodies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes do not form a complete, well-formed frame.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Declared payload exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A message body (MIME or P2P) could not be interpreted.
    #[error("invalid message body: {0}")]
    InvalidBody(String),

    /// A content descriptor parameter could not be parsed.
    #[error("invalid content descriptor: {0}")]
    Descriptor(#[from] ObjectError),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub fn invalid_body(reason: impl Into<String>) -> Self {
        Self::InvalidBody(reason.into())
    }
}
