//! Error types for the hostlink library

use crate::state::InvalidTransition;
use hostlink_proto::ProtocolError;
use hostlink_ssh::TransportError;
use thiserror::Error;

/// Main error type for hostlink operations
#[derive(Debug, Error)]
pub enum HostlinkError {
    /// Transport-level failure that was not absorbed by a retry loop
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The requested operation failed on the host; never retried
    #[error("Operation failed: {0}")]
    Operation(TransportError),

    /// Reconnect budget exhausted
    #[error("Connection to {key} lost after {attempts} reconnect attempts")]
    FatalConnection {
        /// Key of the session that gave up
        key: String,
        /// Reconnect attempts made
        attempts: u32,
    },

    /// Pool has no sessions
    #[error("No sessions in pool {key}")]
    EmptyPool {
        /// Pool key
        key: String,
    },

    /// Key is not registered
    #[error("Key not found: {key}")]
    KeyNotFound {
        /// Missing key
        key: String,
    },

    /// Host could not be resolved or credentials are incomplete
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Session was closed
    #[error("Session {key} is closed")]
    SessionClosed {
        /// Session key
        key: String,
    },

    /// Descriptor or output decoding errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session state machine rejected an event
    #[error("Invalid state transition: {0}")]
    InvalidState(#[from] InvalidTransition),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostlinkError {
    /// Whether this error describes the outcome of the operation rather than the connection
    pub fn is_operation_error(&self) -> bool {
        matches!(self, Self::Operation(_))
    }

    /// Inner transport error of an operation failure
    pub fn operation_error(&self) -> Option<&TransportError> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for HostlinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Configuration(msg) => Self::Configuration(msg),
            err if err.is_transient() => Self::Transport(err),
            err => Self::Operation(err),
        }
    }
}
