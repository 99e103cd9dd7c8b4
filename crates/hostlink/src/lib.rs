//! # Hostlink
//!
//! Self-healing connections to remote (SSH) and local machines.
//!
//! A [`Session`] gives uniform file, path and process operations on one
//! host and transparently reconnects when its transport dies. A
//! [`MultiConnection`] keeps pools of sessions per host alias, rotates
//! between them round-robin and can send one operation to every host at
//! once.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use hostlink_proto as proto;
pub use hostlink_ssh as ssh;

/// Error types for the hostlink library
pub mod error;

/// Session lifecycle states
pub mod state;

/// Reconnect budget and backoff
pub mod retry;

/// Connection event reporting
pub mod report;

/// Sessions and resilient execution
pub mod session;

/// Typed operations on a host
pub mod ops;

/// Round-robin session pools
pub mod pool;

/// Lazy multi-host results
pub mod fanout;

/// Keyed aggregates of session pools
pub mod multi;

/// Session construction
pub mod factory;

pub use error::HostlinkError;
pub use factory::{FactoryConfig, SessionFactory};
pub use fanout::FanOut;
pub use multi::{MultiConnection, MultiConnectionBuilder};
pub use ops::RemoteOps;
pub use pool::SessionPool;
pub use report::{ChannelReporter, NullReporter, ReportEvent, Reporter, TracingReporter};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use session::{Session, SessionBuilder, SessionOptions};
pub use state::{InvalidTransition, SessionEvent, SessionStatus};

pub use hostlink_proto::{DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput};
pub use hostlink_ssh::{Credentials, HostConfig, HostEntry};

/// Result type alias for hostlink operations
pub type Result<T> = std::result::Result<T, HostlinkError>;
