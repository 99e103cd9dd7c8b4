//! # Hostlink Protocol
//!
//! Operation types, results and session descriptors shared by the hostlink
//! transport layer and session pools.

#![warn(missing_docs)]

/// Operation and result types
pub mod message;

/// Aggregate descriptors for persistence
pub mod descriptor;

/// Descriptor codecs
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{DescriptorCodec, Format};
pub use descriptor::{ConnectionKind, Descriptor, SessionRecord, DEFAULT_SSH_PORT};
pub use error::ProtocolError;
pub use message::{DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput, RemoteErrorKind};
