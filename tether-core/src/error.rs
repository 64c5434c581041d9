//! Tether Error Types
//!
//! Errors that escape to callers. Backpressure and timeouts are reported as
//! plain `bool`/`Option` values by the core and never show up here; protocol
//! invariant violations panic instead of returning.

use std::io;
use thiserror::Error;

/// Main error type for tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    /// IO error (thread spawn, OS resources)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The context was terminated; the socket must be closed
    #[error("Context terminated")]
    Terminated,

    /// The mailbox signaler was closed while waiting
    #[error("Mailbox closed")]
    MailboxClosed,

    /// Operation did not complete before its timeout
    #[error("Operation would block")]
    WouldBlock,

    /// Endpoint string is malformed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Endpoint is already bound by another socket
    #[error("Endpoint already in use: {0}")]
    AddressInUse(String),

    /// Endpoint is not bound
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// All socket slots of the context are in use
    #[error("Too many open sockets (max: {max})")]
    TooManySockets { max: usize },

    /// The context was created without I/O threads
    #[error("No I/O thread available")]
    NoIoThread,
}

/// Result type alias for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

impl TetherError {
    /// Create an invalid endpoint error
    pub fn invalid_endpoint(endpoint: impl Into<String>) -> Self {
        Self::InvalidEndpoint(endpoint.into())
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::WouldBlock => true,
            Self::Terminated | Self::MailboxClosed => false,
            _ => false,
        }
    }

    /// Check if this error means the owning context is going away
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Terminated | Self::MailboxClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(TetherError::WouldBlock.is_recoverable());
        assert!(TetherError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_recoverable());
        assert!(!TetherError::Terminated.is_recoverable());
        assert!(!TetherError::EndpointNotFound("x".into()).is_recoverable());
    }

    #[test]
    fn test_shutdown_classification() {
        assert!(TetherError::Terminated.is_shutdown());
        assert!(TetherError::MailboxClosed.is_shutdown());
        assert!(!TetherError::WouldBlock.is_shutdown());
    }
}
