//! Transport abstraction and implementations

use async_trait::async_trait;
use crate::TransportError;
use hostlink_proto::{ConnectionKind, OpOutput, Operation, DEFAULT_SSH_PORT};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport abstraction for different connection types
///
/// A transport knows how to turn [`Credentials`] into a live [`Channel`].
/// Transports are shared between sessions, so `connect` takes `&self`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate, returning a live channel
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Channel>, TransportError>;

    /// Kind of transport
    fn transport_type(&self) -> TransportType;
}

/// An authenticated connection able to execute operations
#[async_trait]
pub trait Channel: Send + Sync {
    /// Execute one operation
    async fn execute(&self, operation: &Operation) -> Result<OpOutput, TransportError>;

    /// Close the connection; closing twice is a no-op
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the channel still believes it is connected
    fn is_connected(&self) -> bool;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Connection type
    pub transport_type: TransportType,
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with libssh2
    SshLibssh2,
    /// Local machine
    Local,
    /// Test double
    Mock,
}

/// Everything needed to (re)open a connection to one host
#[derive(Clone)]
pub struct Credentials {
    /// Remote or local
    pub kind: ConnectionKind,
    /// Login name
    pub username: Option<String>,
    /// Remote hostname or IP
    pub host: Option<String>,
    /// Remote port (default: 22)
    pub port: u16,
    /// SSH key path
    pub identity_file: Option<PathBuf>,
    /// Password, never persisted
    pub password: Option<String>,
    /// Try a running ssh-agent first
    pub allow_agent: bool,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Credentials {
    /// Credentials for the local machine
    pub fn local() -> Self {
        Self {
            kind: ConnectionKind::Local,
            username: None,
            host: None,
            port: DEFAULT_SSH_PORT,
            identity_file: None,
            password: None,
            allow_agent: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Credentials for a remote host
    pub fn remote(username: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            kind: ConnectionKind::Remote,
            username: Some(username.into()),
            host: Some(host.into()),
            ..Self::local()
        }
    }

    /// Set SSH key path
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Set password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable/disable ssh-agent authentication
    pub fn with_agent(mut self, allow_agent: bool) -> Self {
        self.allow_agent = allow_agent;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `user@host:port` for logs, or `local`
    pub fn target(&self) -> String {
        match self.kind {
            ConnectionKind::Local => "local".to_string(),
            ConnectionKind::Remote => format!(
                "{}@{}:{}",
                self.username.as_deref().unwrap_or("?"),
                self.host.as_deref().unwrap_or("?"),
                self.port
            ),
        }
    }

    /// Check that remote credentials carry a user, a host and some way to log in
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.kind.is_local() {
            return Ok(());
        }
        if self.host.as_deref().map_or(true, str::is_empty) {
            return Err(TransportError::Configuration("missing host address".to_string()));
        }
        if self.username.as_deref().map_or(true, str::is_empty) {
            return Err(TransportError::Configuration("missing username".to_string()));
        }
        if !self.allow_agent && self.identity_file.is_none() && self.password.is_none() {
            return Err(TransportError::Configuration(format!(
                "no identity file, password or agent for {}",
                self.target()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("identity_file", &self.identity_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("allow_agent", &self.allow_agent)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Join a command for the remote shell.
///
/// A single element is passed through untouched so callers can hand over
/// shell snippets (`"echo $HOME"`); multiple elements are quoted as
/// individual arguments.
pub fn shell_command(command: &[String]) -> String {
    match command {
        [single] => single.clone(),
        parts => parts
            .iter()
            .map(|part| shell_quote(part))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// SSH transport backed by libssh2
///
/// libssh2 is blocking, so every call is moved onto tokio's blocking pool.
#[cfg(feature = "ssh2")]
#[derive(Debug, Default, Clone)]
pub struct SshTransport;

#[cfg(feature = "ssh2")]
impl SshTransport {
    /// Create a new SSH transport
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "ssh2")]
#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Channel>, TransportError> {
        credentials.validate()?;
        tracing::info!("Connecting to {}", credentials.target());

        let credentials = credentials.clone();
        let connection = tokio::task::spawn_blocking(move || crate::SshConnection::open(&credentials))
            .await
            .map_err(|e| TransportError::Connection(format!("connect task failed: {}", e)))??;

        Ok(Arc::new(connection))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::SshLibssh2
    }
}
