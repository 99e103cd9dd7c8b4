//! Transport error types

use hostlink_proto::RemoteErrorKind;
use std::io;
use thiserror::Error;

/// Transport-specific errors
///
/// Variants split into two classes. Failures of the connection itself
/// (see [`TransportError::is_transient`]) may be healed by reconnecting;
/// everything else describes the outcome of the requested operation and
/// must reach the caller unchanged.
#[derive(Debug, Error)]
pub enum TransportError {
    /// SSH connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// I/O error on the connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Channel or subsystem could not be opened or was dropped
    #[error("Channel error: {0}")]
    Channel(String),

    /// The host rejected the operation
    #[error("{kind}: {message}")]
    Remote {
        /// Failure class
        kind: RemoteErrorKind,
        /// Error message
        message: String,
    },

    /// Remote command failed
    #[error("Remote command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code of the failed command
        code: i32,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation not supported by this transport
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether the failure is attributable to the connection and may be
    /// retried after reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Authentication(_) | Self::Io(_) | Self::Timeout | Self::Channel(_)
        )
    }

    /// Shorthand for an operation-level failure
    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Failure class if this is an operation-level remote error
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Classify an error from the local filesystem as an operation error
    pub fn from_local_io(err: io::Error, context: impl std::fmt::Display) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => RemoteErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => RemoteErrorKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => RemoteErrorKind::AlreadyExists,
            _ => RemoteErrorKind::Other,
        };
        Self::remote(kind, format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Connection("reset".into()).is_transient());
        assert!(TransportError::Authentication("channel drop".into()).is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_transient());
        assert!(TransportError::Channel("sftp".into()).is_transient());

        assert!(!TransportError::remote(RemoteErrorKind::NotFound, "/x").is_transient());
        assert!(!TransportError::CommandFailed { code: 1, message: "".into() }.is_transient());
        assert!(!TransportError::Configuration("bad".into()).is_transient());
        assert!(!TransportError::Unsupported("chmod".into()).is_transient());
    }

    #[test]
    fn test_from_local_io() {
        let err = TransportError::from_local_io(io::Error::from(io::ErrorKind::NotFound), "/nope");
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::NotFound));
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("not found: /nope"));
    }
}
