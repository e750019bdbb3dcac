//! Client error types.

use std::fmt;

use msnp_engine::EngineError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// A secret reference could not be resolved.
    Secret(String),
    /// IO error.
    Io(std::io::Error),
    /// Engine error (login, conversation, transfer).
    Engine(EngineError),
    /// The session ended under us.
    Disconnected(String),
    /// A transfer ended without delivering the object.
    Transfer(String),
    /// Bad command-line input.
    Usage(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Secret(msg) => write!(f, "secret error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Engine(err) => write!(f, "{}", err),
            Self::Disconnected(reason) => write!(f, "disconnected: {}", reason),
            Self::Transfer(msg) => write!(f, "transfer failed: {}", msg),
            Self::Usage(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Engine(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<EngineError> for ClientError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}
