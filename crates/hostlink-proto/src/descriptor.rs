//! Transport-independent description of a session aggregate
//!
//! A [`Descriptor`] records, for every session in an aggregate, the key it
//! is registered under, whether it is remote or local, and the credentials
//! needed to open it again. Live transport state is never captured, so a
//! descriptor always reconstructs disconnected sessions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a session reaches its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Over an SSH session
    Remote,
    /// The machine this process runs on
    Local,
}

impl ConnectionKind {
    /// Whether this is a local connection
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// Persisted form of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Logical key (host alias) the session is registered under
    pub key: String,
    /// Remote or local
    pub connection_kind: ConnectionKind,
    /// Login name, absent for local sessions
    #[serde(default)]
    pub username: Option<String>,
    /// Host address, absent for local sessions
    #[serde(default)]
    pub host: Option<String>,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key file
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Authenticate through a running ssh-agent
    #[serde(default)]
    pub allow_agent: bool,
    /// Serialize all operations on this session
    #[serde(default)]
    pub thread_safe: bool,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl SessionRecord {
    /// Record for a local session
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            connection_kind: ConnectionKind::Local,
            username: None,
            host: None,
            port: DEFAULT_SSH_PORT,
            identity_file: None,
            allow_agent: false,
            thread_safe: false,
        }
    }

    /// Record for a remote session
    pub fn remote(
        key: impl Into<String>,
        username: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            connection_kind: ConnectionKind::Remote,
            username: Some(username.into()),
            host: Some(host.into()),
            port: DEFAULT_SSH_PORT,
            identity_file: None,
            allow_agent: false,
            thread_safe: false,
        }
    }
}

/// Persisted form of a whole aggregate, one record per session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Session records in key-registration order, pool order within a key
    pub sessions: Vec<SessionRecord>,
}

impl Descriptor {
    /// Create an empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&mut self, record: SessionRecord) {
        self.sessions.push(record);
    }

    /// Number of sessions described
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are described
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions per key
    pub fn pool_sizes(&self) -> BTreeMap<String, usize> {
        let mut sizes = BTreeMap::new();
        for record in &self.sessions {
            *sizes.entry(record.key.clone()).or_insert(0) += 1;
        }
        sizes
    }
}

impl FromIterator<SessionRecord> for Descriptor {
    fn from_iter<I: IntoIterator<Item = SessionRecord>>(iter: I) -> Self {
        Self {
            sessions: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes() {
        let descriptor: Descriptor = vec![
            SessionRecord::remote("a", "user", "10.0.0.1"),
            SessionRecord::remote("a", "user", "10.0.0.1"),
            SessionRecord::local("b"),
        ]
        .into_iter()
        .collect();

        let sizes = descriptor.pool_sizes();
        assert_eq!(sizes.get("a"), Some(&2));
        assert_eq!(sizes.get("b"), Some(&1));
        assert_eq!(descriptor.len(), 3);
    }

    #[test]
    fn test_connection_kind_serde() {
        let json = serde_json::to_string(&ConnectionKind::Local).unwrap();
        assert_eq!(json, "\"local\"");
        let kind: ConnectionKind = serde_json::from_str("\"remote\"").unwrap();
        assert_eq!(kind, ConnectionKind::Remote);
    }

    #[test]
    fn test_record_defaults_on_missing_fields() {
        let record: SessionRecord =
            serde_json::from_str(r#"{"key": "h1", "connection_kind": "local"}"#).unwrap();
        assert_eq!(record, SessionRecord::local("h1"));
    }
}
