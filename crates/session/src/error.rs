//! Session and transport error types

use crate::state::SessionState;
use thiserror::Error;

/// Failure reported by a transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device not found")]
    NotFound,

    /// Endpoint halted; the only class eligible for local retry
    #[error("Endpoint stalled")]
    Stall,

    #[error("Operation timed out")]
    Timeout,

    #[error("Device disconnected")]
    NoDevice,

    #[error("Access denied")]
    Access,

    #[error("Resource busy")]
    Busy,

    #[error("Operation not supported on this platform")]
    Unsupported,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_stall(&self) -> bool {
        matches!(self, TransportError::Stall)
    }
}

/// Errors returned synchronously from the public session API
#[derive(Debug, Error)]
pub enum SessionError {
    /// Device absent or the transport's open call failed
    #[error("Failed to open device {target}: {source}")]
    OpenFailed {
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("Transfer failed: {0}")]
    Transfer(#[source] TransportError),

    #[error("Device enumeration failed: {0}")]
    Enumerate(#[source] TransportError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("Device is not open")]
    NotOpen,

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Hot-plug registration failed: {0}")]
    Hotplug(#[source] TransportError),

    #[error("Session has been terminated")]
    Terminated,

    /// The process-wide transport context could not be created
    #[error("Transport context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Failed to spawn session thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

impl From<SessionError> for common::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ThreadSpawn(e) => common::Error::Io(e),
            other => common::Error::Other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::OpenFailed {
            target: "1234:5678".to_string(),
            source: TransportError::NotFound,
        };
        let msg = err.to_string();
        assert!(msg.contains("1234:5678"));
        assert!(msg.contains("not found"));

        let err = SessionError::InvalidTransition {
            from: SessionState::Terminate,
            to: SessionState::Opened,
        };
        assert_eq!(err.to_string(), "Invalid state transition TERMINATE -> OPENED");
    }

    #[test]
    fn test_into_common_error() {
        let spawn = std::io::Error::other("no threads left");
        let err: common::Error = SessionError::ThreadSpawn(spawn).into();
        assert!(matches!(err, common::Error::Io(_)));

        let err: common::Error = SessionError::Transfer(TransportError::NoDevice).into();
        match err {
            common::Error::Other(msg) => assert!(msg.contains("disconnected")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stall_class() {
        assert!(TransportError::Stall.is_stall());
        assert!(!TransportError::Timeout.is_stall());
        assert!(!TransportError::Io("x".into()).is_stall());
    }
}
