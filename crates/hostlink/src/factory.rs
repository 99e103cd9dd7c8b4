//! Session construction from host aliases and credentials

use crate::report::{Reporter, TracingReporter};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionOptions};
use crate::{HostlinkError, Result};
use hostlink_proto::{ConnectionKind, ProtocolError, SessionRecord};
use hostlink_ssh::{Credentials, HostConfig, HostEntry, LocalTransport, Transport};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Factory configuration
#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
    /// SSH config file; `~/.ssh/config` when unset
    pub ssh_config_path: Option<PathBuf>,
    /// Default thread-safety flag for new sessions
    pub thread_safe: bool,
    /// Reconnect policy for new sessions
    pub retry_policy: RetryPolicy,
}

impl FactoryConfig {
    /// Read hosts from `path`
    pub fn with_ssh_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_config_path = Some(path.into());
        self
    }

    /// Make new sessions thread-safe by default
    pub fn with_thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    /// Set the reconnect policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Resolves keys into sessions.
///
/// Remote keys are looked up in the host configuration; a key that is
/// neither configured nor accompanied by explicit credentials is a
/// configuration error.
pub struct SessionFactory {
    hosts: RwLock<HostConfig>,
    remote_transport: Option<Arc<dyn Transport>>,
    local_transport: Arc<dyn Transport>,
    reporter: Arc<dyn Reporter>,
    thread_safe: bool,
    retry_policy: RetryPolicy,
}

impl Default for SessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory {
    /// Factory with no known hosts
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HostConfig::new()),
            remote_transport: default_remote_transport(),
            local_transport: Arc::new(LocalTransport::new()),
            reporter: Arc::new(TracingReporter),
            thread_safe: false,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Factory reading hosts from the configured SSH config file
    pub async fn from_config(config: FactoryConfig) -> Result<Self> {
        let hosts = match config.ssh_config_path {
            Some(path) => HostConfig::load(&path).await?,
            None => HostConfig::load_default().await?,
        };
        debug!("Session factory knows {} hosts", hosts.len());

        Ok(Self::new()
            .with_hosts(hosts)
            .with_thread_safe(config.thread_safe)
            .with_retry_policy(config.retry_policy))
    }

    /// Replace the host configuration
    pub fn with_hosts(self, hosts: HostConfig) -> Self {
        *self.hosts.write() = hosts;
        self
    }

    /// Transport for remote sessions
    pub fn with_remote_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.remote_transport = Some(transport);
        self
    }

    /// Transport for local sessions
    pub fn with_local_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.local_transport = transport;
        self
    }

    /// Reporting sink for new sessions
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Default thread-safety flag
    pub fn with_thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    /// Reconnect policy for new sessions
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Default thread-safety flag
    pub fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Register or override host aliases
    pub fn add_hosts(&self, entries: impl IntoIterator<Item = HostEntry>) {
        let mut hosts = self.hosts.write();
        for entry in entries {
            debug!("Registering host {}", entry.alias);
            hosts.insert(entry);
        }
    }

    /// Aliases that name both a user and a host, sorted
    pub fn available_hosts(&self) -> Vec<String> {
        let hosts = self.hosts.read();
        hosts
            .available_hosts()
            .filter(|alias| hosts.lookup(alias).map_or(false, |e| e.user.is_some()))
            .map(str::to_string)
            .collect()
    }

    /// Credentials for a configured alias
    pub fn resolve(&self, key: &str) -> Result<Credentials> {
        let hosts = self.hosts.read();
        let entry = hosts.lookup(key).ok_or_else(|| {
            HostlinkError::Configuration(format!("host alias {} is not configured and no credentials were given", key))
        })?;
        Ok(entry.to_credentials()?)
    }

    /// Open a remote session for a configured alias
    pub fn open(&self, key: &str) -> Result<Session> {
        self.open_with(key, SessionOptions::default())
    }

    /// Open a local session registered under `key`
    pub fn open_local(&self, key: &str) -> Result<Session> {
        self.open_with(key, SessionOptions::local())
    }

    /// Open a session with explicit credentials
    pub fn open_credentials(&self, key: &str, credentials: Credentials) -> Result<Session> {
        self.open_with(key, SessionOptions::default().with_credentials(credentials))
    }

    /// Open a session. Sessions connect lazily on first use.
    pub fn open_with(&self, key: &str, options: SessionOptions) -> Result<Session> {
        let credentials = match options.credentials {
            Some(credentials) => credentials,
            None if options.local => Credentials::local(),
            None => self.resolve(key)?,
        };
        let thread_safe = options.thread_safe.unwrap_or(self.thread_safe);
        self.build(key, credentials, thread_safe)
    }

    /// Rebuild a disconnected session from its persisted form
    pub fn open_record(&self, record: &SessionRecord) -> Result<Session> {
        let credentials = match record.connection_kind {
            ConnectionKind::Local => Credentials::local(),
            ConnectionKind::Remote => {
                let (Some(username), Some(host)) = (&record.username, &record.host) else {
                    return Err(ProtocolError::InvalidRecord {
                        key: record.key.clone(),
                        message: "remote record without username or host".to_string(),
                    }
                    .into());
                };
                let mut credentials = Credentials::remote(username.clone(), host.clone())
                    .with_port(record.port)
                    .with_agent(record.allow_agent);
                credentials.identity_file = record.identity_file.clone();
                credentials
            }
        };
        self.build(&record.key, credentials, record.thread_safe)
    }

    fn build(&self, key: &str, credentials: Credentials, thread_safe: bool) -> Result<Session> {
        let transport = match credentials.kind {
            ConnectionKind::Local => Arc::clone(&self.local_transport),
            ConnectionKind::Remote => self.remote_transport.clone().ok_or_else(|| {
                HostlinkError::Configuration(
                    "no transport for remote sessions; enable the ssh2 feature or inject one".to_string(),
                )
            })?,
        };

        let credentials = credentials.with_connect_timeout(self.retry_policy.connect_timeout);
        debug!("Opening session {} ({})", key, credentials.target());
        Ok(Session::builder(key, credentials, transport)
            .retry_policy(self.retry_policy.clone())
            .reporter(Arc::clone(&self.reporter))
            .thread_safe(thread_safe)
            .build())
    }
}

#[cfg(feature = "ssh2")]
fn default_remote_transport() -> Option<Arc<dyn Transport>> {
    Some(Arc::new(hostlink_ssh::SshTransport::new()))
}

#[cfg(not(feature = "ssh2"))]
fn default_remote_transport() -> Option<Arc<dyn Transport>> {
    None
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("hosts", &self.hosts.read().len())
            .field("remote_transport", &self.remote_transport.as_ref().map(|t| t.transport_type()))
            .field("thread_safe", &self.thread_safe)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_ssh::MockTransport;
    use std::io::Write;

    const HOSTS: &str = "Host build\n  HostName build.example.com\n  User ci\n  Port 2222\n\nHost nouser\n  HostName 10.0.0.9\n";

    fn factory() -> SessionFactory {
        SessionFactory::new()
            .with_hosts(HostConfig::parse(HOSTS))
            .with_remote_transport(Arc::new(MockTransport::new()))
    }

    #[test]
    fn test_open_configured_alias() {
        let session = factory().open("build").unwrap();
        assert_eq!(session.key(), "build");
        assert_eq!(session.kind(), ConnectionKind::Remote);
        assert_eq!(session.credentials().target(), "ci@build.example.com:2222");
        assert!(!session.is_thread_safe());
    }

    #[test]
    fn test_unknown_alias_is_configuration_error() {
        assert!(matches!(factory().open("ghost"), Err(HostlinkError::Configuration(_))));
        assert!(matches!(factory().open("nouser"), Err(HostlinkError::Configuration(_))));
    }

    #[test]
    fn test_explicit_credentials_and_local() {
        let factory = factory().with_thread_safe(true);
        let session = factory
            .open_credentials("adhoc", Credentials::remote("me", "10.1.1.1").with_agent(true))
            .unwrap();
        assert_eq!(session.credentials().host.as_deref(), Some("10.1.1.1"));
        assert!(session.is_thread_safe());

        let local = factory
            .open_with("laptop", SessionOptions::local().with_thread_safe(false))
            .unwrap();
        assert_eq!(local.kind(), ConnectionKind::Local);
        assert!(!local.is_thread_safe());
    }

    #[test]
    fn test_available_hosts_and_add_hosts() {
        let factory = factory();
        assert_eq!(factory.available_hosts(), vec!["build"]);

        factory.add_hosts([HostEntry {
            alias: "gpu".into(),
            hostname: Some("gpu.example.com".into()),
            user: Some("ml".into()),
            ..Default::default()
        }]);
        assert_eq!(factory.available_hosts(), vec!["build", "gpu"]);
        assert!(factory.open("gpu").is_ok());
    }

    #[test]
    fn test_open_record() {
        let factory = factory();
        let original = factory.open("build").unwrap();
        let restored = factory.open_record(&original.to_record()).unwrap();

        assert_eq!(restored.to_record(), original.to_record());
        assert_ne!(restored, original);

        let mut broken = original.to_record();
        broken.host = None;
        assert!(matches!(factory.open_record(&broken), Err(HostlinkError::Protocol(_))));
    }

    #[test]
    fn test_remote_without_transport() {
        let factory = SessionFactory {
            remote_transport: None,
            ..factory()
        };
        assert!(matches!(factory.open("build"), Err(HostlinkError::Configuration(_))));
        assert!(factory.open_local("here").is_ok());
    }

    #[tokio::test]
    async fn test_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(HOSTS.as_bytes()).unwrap();

        let config = FactoryConfig::default()
            .with_ssh_config_path(file.path())
            .with_thread_safe(true);
        let factory = SessionFactory::from_config(config).await.unwrap();
        assert_eq!(factory.available_hosts(), vec!["build"]);
        assert!(factory.thread_safe());
    }
}
