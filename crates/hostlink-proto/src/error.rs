//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Encoded descriptor too large
    #[error("Descriptor too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// A transport answered an operation with the wrong kind of output
    #[error("Unexpected output for {operation}: expected {expected}, got {actual}")]
    UnexpectedOutput {
        /// Operation name
        operation: &'static str,
        /// Expected output kind
        expected: &'static str,
        /// Output kind received
        actual: &'static str,
    },

    /// A descriptor record is missing a required field
    #[error("Invalid session record for {key}: {message}")]
    InvalidRecord {
        /// Key of the offending record
        key: String,
        /// What is wrong with it
        message: String,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

#[cfg(feature = "rmp-serde")]
impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

#[cfg(feature = "rmp-serde")]
impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}
