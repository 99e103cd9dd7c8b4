//! SSH config parsing
//!
//! Reads `~/.ssh/config` so sessions can be opened by host alias. Only the
//! directives needed to open a session are interpreted: `Host`, `HostName`,
//! `User`, `Port` and `IdentityFile`. Wildcard patterns are skipped.

use crate::transport::Credentials;
use crate::TransportError;
use hostlink_proto::DEFAULT_SSH_PORT;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// One concrete host from an SSH config file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    /// Host alias (the pattern after "Host")
    pub alias: String,
    /// Actual hostname (HostName directive)
    pub hostname: Option<String>,
    /// Username (User directive)
    pub user: Option<String>,
    /// Port number (Port directive)
    pub port: Option<u16>,
    /// Identity file path (IdentityFile directive), `~` expanded
    pub identity_file: Option<PathBuf>,
}

impl HostEntry {
    /// Get the effective hostname (hostname or alias)
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    /// Get effective port (port or 22)
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Build remote credentials for this host.
    ///
    /// Fails when the entry names no user.
    pub fn to_credentials(&self) -> Result<Credentials, TransportError> {
        let user = self.user.as_deref().ok_or_else(|| {
            TransportError::Configuration(format!("host {} has no User directive", self.alias))
        })?;

        let mut credentials =
            Credentials::remote(user, self.effective_hostname()).with_port(self.effective_port());
        match &self.identity_file {
            Some(key) => credentials = credentials.with_identity_file(key.clone()),
            None => credentials = credentials.with_agent(true),
        }
        Ok(credentials)
    }
}

/// Parsed SSH config, keyed by alias
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    hosts: BTreeMap<String, HostEntry>,
}

impl HostConfig {
    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Default SSH config path (`~/.ssh/config`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("config"))
    }

    /// Load a config file. A missing file yields an empty configuration.
    pub async fn load(path: &Path) -> Result<Self, TransportError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No SSH config at {}", path.display());
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(TransportError::Configuration(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let config = Self::parse(&content);
        debug!("Loaded {} hosts from {}", config.hosts.len(), path.display());
        Ok(config)
    }

    /// Load `~/.ssh/config`, or nothing if there is no home directory
    pub async fn load_default() -> Result<Self, TransportError> {
        match Self::default_path() {
            Some(path) => Self::load(&path).await,
            None => Ok(Self::new()),
        }
    }

    /// Parse config file content
    pub fn parse(content: &str) -> Self {
        let mut config = Self::new();
        let mut current: Vec<HostEntry> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = split_directive(line) else {
                continue;
            };

            if key.eq_ignore_ascii_case("host") {
                config.extend(current.drain(..));
                current = value
                    .split_whitespace()
                    .filter(|alias| !is_pattern(alias))
                    .map(|alias| HostEntry {
                        alias: alias.to_string(),
                        ..Default::default()
                    })
                    .collect();
                continue;
            }

            // First obtained value wins, as in ssh(1)
            for host in current.iter_mut() {
                match key.to_ascii_lowercase().as_str() {
                    "hostname" if host.hostname.is_none() => host.hostname = Some(value.to_string()),
                    "user" if host.user.is_none() => host.user = Some(value.to_string()),
                    "port" if host.port.is_none() => host.port = value.parse().ok(),
                    "identityfile" if host.identity_file.is_none() => {
                        host.identity_file = Some(expand_home(value))
                    }
                    _ => {}
                }
            }
        }
        config.extend(current);
        config
    }

    fn extend(&mut self, entries: impl IntoIterator<Item = HostEntry>) {
        for entry in entries {
            self.hosts.entry(entry.alias.clone()).or_insert(entry);
        }
    }

    /// Look up a host by alias
    pub fn lookup(&self, alias: &str) -> Option<&HostEntry> {
        self.hosts.get(alias)
    }

    /// Register or replace a host
    pub fn insert(&mut self, entry: HostEntry) {
        self.hosts.insert(entry.alias.clone(), entry);
    }

    /// Aliases of all known hosts, sorted
    pub fn available_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    /// Number of known hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether no hosts are known
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Split "Key Value" or "Key=Value"
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let (key, value) = match line.find(|c: char| c == '=' || c.is_whitespace()) {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => return None,
    };
    let value = value.trim().trim_start_matches('=').trim().trim_matches('"');
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn is_pattern(alias: &str) -> bool {
    alias.contains('*') || alias.contains('?') || alias.starts_with('!')
}

fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
# Comment
Host *
    ServerAliveInterval 60

Host build
    HostName build.example.com
    User ci
    Port 2222
    IdentityFile /keys/ci_ed25519

Host gpu1 gpu2
    User admin

Host dev-*
    User developer

Host=bare
    User=root
"#;

    #[test]
    fn test_parse_basic() {
        let config = HostConfig::parse(SAMPLE);
        let build = config.lookup("build").unwrap();
        assert_eq!(build.effective_hostname(), "build.example.com");
        assert_eq!(build.user.as_deref(), Some("ci"));
        assert_eq!(build.effective_port(), 2222);
        assert_eq!(build.identity_file, Some(PathBuf::from("/keys/ci_ed25519")));

        let bare = config.lookup("bare").unwrap();
        assert_eq!(bare.user.as_deref(), Some("root"));
        assert_eq!(bare.effective_hostname(), "bare");
        assert_eq!(bare.effective_port(), 22);
    }

    #[test]
    fn test_multiple_aliases_and_wildcards() {
        let config = HostConfig::parse(SAMPLE);
        let aliases: Vec<_> = config.available_hosts().collect();
        assert_eq!(aliases, vec!["bare", "build", "gpu1", "gpu2"]);
        assert_eq!(config.lookup("gpu2").unwrap().user.as_deref(), Some("admin"));
        assert!(config.lookup("dev-*").is_none());
    }

    #[test]
    fn test_first_value_wins() {
        let config = HostConfig::parse("Host a\n  User first\n  User second\n");
        assert_eq!(config.lookup("a").unwrap().user.as_deref(), Some("first"));
    }

    #[test]
    fn test_tilde_expansion() {
        let config = HostConfig::parse("Host a\n  IdentityFile ~/.ssh/id_rsa\n");
        let key = config.lookup("a").unwrap().identity_file.clone().unwrap();
        if dirs::home_dir().is_some() {
            assert!(key.is_absolute());
            assert!(key.ends_with(".ssh/id_rsa"));
        }
    }

    #[test]
    fn test_to_credentials() {
        let config = HostConfig::parse(SAMPLE);
        let creds = config.lookup("build").unwrap().to_credentials().unwrap();
        assert_eq!(creds.target(), "ci@build.example.com:2222");
        assert!(!creds.allow_agent);

        let creds = config.lookup("gpu1").unwrap().to_credentials().unwrap();
        assert!(creds.allow_agent);

        let no_user = HostEntry {
            alias: "x".into(),
            ..Default::default()
        };
        assert!(matches!(no_user.to_credentials(), Err(TransportError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_load_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = HostConfig::load(file.path()).await.unwrap();
        assert_eq!(config.len(), 4);

        let missing = HostConfig::load(Path::new("/nonexistent/ssh/config")).await.unwrap();
        assert!(missing.is_empty());
    }
}
