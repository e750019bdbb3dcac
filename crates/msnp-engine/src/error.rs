//! Engine error types.

use std::io;

use msnp_protocol::{ProtocolError, SessionId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO error (socket connect, read, write).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, bodies).
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Credentials were rejected or no ticket could be obtained.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// The server does not speak our protocol version.
    #[error("Server does not support protocol {offered}")]
    ProtocolVersion { offered: String },

    /// No switchboard with the participant could be established in time.
    #[error("No route to {account}")]
    NoRoute { account: String },

    /// A P2P chunk arrived out of order, overlapping or oversized.
    #[error("Chunk order violation in session {session}: expected offset {expected}, got {got}")]
    ChunkOrderViolation {
        session: SessionId,
        expected: u64,
        got: u64,
    },

    /// A transfer ended before completion.
    #[error("Transfer {session} aborted: {reason}")]
    TransferAborted { session: SessionId, reason: String },

    /// The connection closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A bounded wait expired.
    #[error("Timeout during {operation}")]
    Timeout { operation: String },

    /// The server answered with a numeric error.
    #[error("Server error {code} in reply to {command}")]
    Server { code: u16, command: String },

    /// The operation needs a signed-in nameserver session.
    #[error("Not signed in")]
    NotSignedIn,

    /// The conversation has ended.
    #[error("Conversation has ended")]
    ConversationEnded,

    /// The switchboard reported that a message was not delivered.
    #[error("Message was not delivered")]
    Undelivered,

    /// No transfer session with that id.
    #[error("Unknown transfer session {session}")]
    UnknownSession { session: SessionId },

    /// Bytes do not match the content descriptor.
    #[error("Content does not match its descriptor hash")]
    HashMismatch,

    /// The operation is not valid in the current state.
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl EngineError {
    /// Creates an authentication error.
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a no route error.
    pub fn no_route(account: impl Into<String>) -> Self {
        Self::NoRoute {
            account: account.into(),
        }
    }

    /// Creates a transfer aborted error.
    pub fn aborted(session: SessionId, reason: impl Into<String>) -> Self {
        Self::TransferAborted {
            session,
            reason: reason.into(),
        }
    }
}

/// Error returned by a [`TicketProvider`](crate::TicketProvider).
#[derive(Debug, Clone, Error)]
#[error("ticket unavailable: {0}")]
pub struct TicketError(pub String);
