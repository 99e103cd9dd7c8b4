//! # Hostlink SSH Transport
//!
//! Connection layer for hostlink: the [`Transport`] and [`Channel`] traits,
//! an SSH implementation on libssh2, a local-machine implementation and an
//! SSH config reader for resolving host aliases.

#![warn(missing_docs)]

/// Transport abstraction and implementations
pub mod transport;

/// SSH connection management
#[cfg(feature = "ssh2")]
pub mod connection;

/// Local machine transport
pub mod local;

/// SSH config parsing
pub mod config;

/// In-memory transport for tests
pub mod mock;

/// Transport error types
pub mod error;

pub use config::{HostConfig, HostEntry};
#[cfg(feature = "ssh2")]
pub use connection::SshConnection;
pub use error::TransportError;
pub use local::{LocalConnection, LocalTransport};
pub use mock::MockTransport;
#[cfg(feature = "ssh2")]
pub use transport::SshTransport;
pub use transport::{Channel, ConnectionInfo, Credentials, Transport, TransportType, DEFAULT_CONNECT_TIMEOUT};
