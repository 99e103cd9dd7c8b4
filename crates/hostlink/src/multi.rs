//! Keyed aggregate of session pools
//!
//! A [`MultiConnection`] maps host aliases to [`SessionPool`]s. Keys keep the
//! order in which they were first registered; every registered key has at
//! least one session. Operations can be sent to one session per key at once
//! through the fan-out helpers, and the whole aggregate can be saved as a
//! [`Descriptor`] and reopened later.

use crate::fanout::FanOut;
use crate::ops::RemoteOps;
use crate::pool::SessionPool;
use crate::{HostlinkError, Result, Session, SessionFactory, SessionOptions};
use bytes::Bytes;
use futures::{stream, FutureExt, StreamExt};
use hostlink_proto::{
    Descriptor, DescriptorCodec, DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput,
};
use hostlink_ssh::HostEntry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Add;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Pools {
    /// Keys in registration order
    order: Vec<String>,
    by_key: HashMap<String, Arc<SessionPool>>,
}

/// Pools of sessions keyed by host alias.
///
/// The key map is behind a short-lived lock, so the aggregate can be shared
/// between tasks (wrap it in an `Arc`). `Clone` is shallow: the copy has its
/// own pools but shares the session handles. [`MultiConnection::deep_copy`]
/// reopens every session instead.
pub struct MultiConnection {
    pools: RwLock<Pools>,
    factory: Arc<SessionFactory>,
    thread_safe: bool,
}

/// Builder for [`MultiConnection`]
pub struct MultiConnectionBuilder {
    factory: Arc<SessionFactory>,
    thread_safe: bool,
    hosts: Vec<(String, SessionOptions)>,
}

impl MultiConnectionBuilder {
    /// Add one session for a configured host alias
    pub fn host(self, key: impl Into<String>) -> Self {
        self.host_with(key, SessionOptions::default())
    }

    /// Add one session per key; repeated keys grow that key's pool
    pub fn hosts<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts
            .extend(keys.into_iter().map(|key| (key.into(), SessionOptions::default())));
        self
    }

    /// Add one local session registered under `key`
    pub fn local(self, key: impl Into<String>) -> Self {
        self.host_with(key, SessionOptions::local())
    }

    /// Add one session with per-key options
    pub fn host_with(mut self, key: impl Into<String>, options: SessionOptions) -> Self {
        self.hosts.push((key.into(), options));
        self
    }

    /// Default thread-safety flag for the sessions of this aggregate
    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    /// Open every session. Sessions connect lazily.
    pub fn build(self) -> Result<MultiConnection> {
        let multi = MultiConnection::empty(self.factory, self.thread_safe);
        for (key, options) in self.hosts {
            let session = multi.open_session(&key, options)?;
            multi.insert(key, session);
        }
        debug!("Opened {} sessions under {} keys", multi.len_all(), multi.len());
        Ok(multi)
    }
}

impl MultiConnection {
    /// Start building an aggregate
    pub fn builder(factory: Arc<SessionFactory>) -> MultiConnectionBuilder {
        MultiConnectionBuilder {
            thread_safe: factory.thread_safe(),
            factory,
            hosts: Vec::new(),
        }
    }

    /// One remote session per key
    pub fn open<I, S>(keys: I, factory: Arc<SessionFactory>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder(factory).hosts(keys).build()
    }

    /// Aggregate with no sessions
    pub fn empty(factory: Arc<SessionFactory>, thread_safe: bool) -> Self {
        Self {
            pools: RwLock::new(Pools::default()),
            factory,
            thread_safe,
        }
    }

    /// Factory used to open new sessions
    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    /// Default thread-safety flag for sessions opened by this aggregate
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn open_session(&self, key: &str, mut options: SessionOptions) -> Result<Session> {
        options.thread_safe = options.thread_safe.or(Some(self.thread_safe));
        self.factory.open_with(key, options)
    }

    /// Pool registered under `key`
    pub fn pool(&self, key: &str) -> Result<Arc<SessionPool>> {
        self.pools
            .read()
            .by_key
            .get(key)
            .cloned()
            .ok_or_else(|| HostlinkError::KeyNotFound { key: key.to_string() })
    }

    /// Pools in key-registration order
    fn snapshot(&self) -> Vec<(String, Arc<SessionPool>)> {
        let pools = self.pools.read();
        pools
            .order
            .iter()
            .filter_map(|key| pools.by_key.get(key).map(|pool| (key.clone(), Arc::clone(pool))))
            .collect()
    }

    /// Next session for `key`, rotating its pool
    pub fn get(&self, key: &str) -> Result<Session> {
        // Rotate under the read guard so a concurrent pop cannot empty the
        // pool between lookup and rotation
        let pools = self.pools.read();
        pools
            .by_key
            .get(key)
            .ok_or_else(|| HostlinkError::KeyNotFound { key: key.to_string() })?
            .get()
    }

    /// Next session for `key`, or `default` when the key is absent
    pub fn get_or(&self, key: &str, default: Session) -> Session {
        self.get(key).unwrap_or(default)
    }

    /// All sessions for `key` in insertion order, without rotating
    pub fn get_all(&self, key: &str) -> Result<Vec<Session>> {
        Ok(self.pool(key)?.get_all())
    }

    /// Append a session under `key`.
    ///
    /// This never replaces: an existing pool grows by one.
    pub fn insert(&self, key: impl Into<String>, session: Session) {
        let key = key.into();
        let mut pools = self.pools.write();
        let Pools { order, by_key } = &mut *pools;
        let pool = by_key.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Arc::new(SessionPool::new(key.clone()))
        });
        pool.add(session);
    }

    /// Append a session under its own key
    pub fn push(&self, session: Session) {
        self.insert(session.key().to_string(), session);
    }

    /// Remove and close the oldest session under `key`.
    ///
    /// The key is gone before the session is closed.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let session = self.pop(key)?;
        debug!("Removed session {} from {}", session.id(), key);
        if let Err(e) = session.close().await {
            warn!("Failed to close session removed from {}: {}", key, e);
        }
        Ok(())
    }

    /// Remove the oldest session under `key` and hand it back still open
    pub fn pop(&self, key: &str) -> Result<Session> {
        let mut pools = self.pools.write();
        let pool = pools
            .by_key
            .get(key)
            .cloned()
            .ok_or_else(|| HostlinkError::KeyNotFound { key: key.to_string() })?;
        let (session, emptied) = pool.take_one()?;
        if emptied {
            pools.by_key.remove(key);
            pools.order.retain(|k| k != key);
            debug!("Pruned empty pool {}", key);
        }
        Ok(session)
    }

    /// Remove every session under `key`, still open
    pub fn pop_all(&self, key: &str) -> Result<Vec<Session>> {
        let pool = {
            let mut pools = self.pools.write();
            let pool = pools
                .by_key
                .remove(key)
                .ok_or_else(|| HostlinkError::KeyNotFound { key: key.to_string() })?;
            pools.order.retain(|k| k != key);
            pool
        };
        Ok(pool.take_all())
    }

    /// Pop one session from the most recently registered key
    pub fn pop_item(&self) -> Option<(String, Session)> {
        let key = self.pools.read().order.last().cloned()?;
        let session = self.pop(&key).ok()?;
        Some((key, session))
    }

    /// Pop every session from the most recently registered key
    pub fn pop_item_all(&self) -> Option<(String, Vec<Session>)> {
        let key = self.pools.read().order.last().cloned()?;
        let sessions = self.pop_all(&key).ok()?;
        Some((key, sessions))
    }

    /// Whether `key` has sessions
    pub fn contains_key(&self, key: &str) -> bool {
        self.pools.read().by_key.contains_key(key)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.pools.read().order.len()
    }

    /// Number of sessions across all keys
    pub fn len_all(&self) -> usize {
        self.snapshot().iter().map(|(_, pool)| pool.len()).sum()
    }

    /// Whether there are no sessions
    pub fn is_empty(&self) -> bool {
        self.pools.read().order.is_empty()
    }

    /// Keys in registration order
    pub fn keys(&self) -> Vec<String> {
        self.pools.read().order.clone()
    }

    /// One session per key, rotating each pool once
    pub fn values(&self) -> Vec<Session> {
        self.items().into_iter().map(|(_, session)| session).collect()
    }

    /// One `(key, session)` pair per key, rotating each pool once
    pub fn items(&self) -> Vec<(String, Session)> {
        let pools = self.pools.read();
        pools
            .order
            .iter()
            .filter_map(|key| {
                let session = pools.by_key.get(key)?.get().ok()?;
                Some((key.clone(), session))
            })
            .collect()
    }

    /// Each key repeated once per session
    pub fn keys_all(&self) -> Vec<String> {
        self.items_all().into_iter().map(|(key, _)| key).collect()
    }

    /// Every session, grouped by key in registration order
    pub fn values_all(&self) -> Vec<Session> {
        self.items_all().into_iter().map(|(_, session)| session).collect()
    }

    /// Every `(key, session)` pair
    pub fn items_all(&self) -> Vec<(String, Session)> {
        self.snapshot()
            .into_iter()
            .flat_map(|(key, pool)| {
                pool.get_all()
                    .into_iter()
                    .map(move |session| (key.clone(), session))
            })
            .collect()
    }

    /// Append every session of `other`, pool by pool
    pub fn update(&self, other: &MultiConnection) {
        for (key, session) in other.items_all() {
            self.insert(key, session);
        }
    }

    /// Concatenate two aggregates
    pub fn merge(self, other: MultiConnection) -> Self {
        self.update(&other);
        self
    }

    /// Register host entries with the factory and open one session each
    pub fn add_hosts(&self, entries: impl IntoIterator<Item = HostEntry>) -> Result<()> {
        let entries: Vec<HostEntry> = entries.into_iter().collect();
        let keys: Vec<String> = entries.iter().map(|entry| entry.alias.clone()).collect();
        self.factory.add_hosts(entries);

        for key in keys {
            let session = self.open_session(&key, SessionOptions::default())?;
            self.insert(key, session);
        }
        Ok(())
    }

    /// Connect every session now instead of on first use
    pub async fn connect_all(&self) -> Result<()> {
        for session in self.values_all() {
            session.connect().await?;
        }
        Ok(())
    }

    /// Close every session, keeping them registered
    pub async fn close(&self) {
        for (_, pool) in self.snapshot() {
            pool.close_all().await;
        }
        info!("Closed {} sessions", self.len_all());
    }

    /// Close every session and empty the aggregate
    pub async fn clear(&self) {
        let pools = std::mem::take(&mut *self.pools.write());
        for pool in pools.by_key.into_values() {
            pool.remove_all().await;
        }
    }

    /// Persistable description of every session.
    ///
    /// Records are listed in key-registration order, pool order within a
    /// key. Passwords and live transport state are never included.
    pub fn to_descriptor(&self) -> Descriptor {
        self.items_all()
            .into_iter()
            .map(|(key, session)| {
                let mut record = session.to_record();
                record.key = key;
                record
            })
            .collect()
    }

    /// Reopen an aggregate from a descriptor; sessions come back disconnected
    pub fn from_descriptor(descriptor: &Descriptor, factory: Arc<SessionFactory>) -> Result<Self> {
        let multi = Self::empty(Arc::clone(&factory), factory.thread_safe());
        for record in &descriptor.sessions {
            let session = factory.open_record(record)?;
            multi.insert(record.key.clone(), session);
        }
        Ok(multi)
    }

    /// JSON form of [`MultiConnection::to_descriptor`]
    pub fn to_json_string(&self) -> Result<String> {
        Ok(DescriptorCodec::to_json_string(&self.to_descriptor())?)
    }

    /// Reopen an aggregate from its JSON form
    pub fn from_json_str(text: &str, factory: Arc<SessionFactory>) -> Result<Self> {
        let descriptor = DescriptorCodec::from_json_str(text)?;
        Self::from_descriptor(&descriptor, factory)
    }

    /// MessagePack form of [`MultiConnection::to_descriptor`]
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(DescriptorCodec::msgpack().encode(&self.to_descriptor())?)
    }

    /// Reopen an aggregate from its MessagePack form
    pub fn from_bytes(data: &[u8], factory: Arc<SessionFactory>) -> Result<Self> {
        let descriptor = DescriptorCodec::msgpack().decode(data)?;
        Self::from_descriptor(&descriptor, factory)
    }

    /// Copy with freshly opened, disconnected sessions
    pub fn deep_copy(&self) -> Result<Self> {
        let copy = Self::from_descriptor(&self.to_descriptor(), Arc::clone(&self.factory))?;
        Ok(Self {
            thread_safe: self.thread_safe,
            ..copy
        })
    }

    /// Run `call` on one session per key.
    ///
    /// The set of keys is fixed when the fan-out is created; keys added or
    /// removed afterwards are not seen. Each key's pool is rotated only when
    /// that key's call starts, so no session is picked and no operation runs
    /// until the returned stream is polled.
    pub fn fan_out_with<T, F, Fut>(&self, call: F) -> FanOut<T>
    where
        T: Send + 'static,
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let call = Arc::new(call);
        let calls = stream::iter(self.snapshot())
            .map(move |(key, pool)| {
                let call = Arc::clone(&call);
                async move {
                    let session = pool.get()?;
                    let value = call(session).await?;
                    Ok((key, value))
                }
                .boxed()
            })
            .boxed();
        FanOut::new(calls)
    }

    /// Run a raw operation on one session per key
    pub fn fan_out(&self, operation: Operation) -> FanOut<OpOutput> {
        self.fan_out_with(move |session| {
            let operation = operation.clone();
            async move { session.execute(&operation).await }
        })
    }

    fn fan_out_path<T, F, Fut>(&self, path: PathBuf, call: F) -> FanOut<T>
    where
        T: Send + 'static,
        F: Fn(Session, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fan_out_with(move |session| call(session, path.clone()))
    }

    /// [`RemoteOps::exists`] on one session per key
    pub fn exists(&self, path: impl Into<PathBuf>) -> FanOut<bool> {
        self.fan_out_path(path.into(), |s, p| async move { s.exists(&p).await })
    }

    /// [`RemoteOps::is_file`] on one session per key
    pub fn is_file(&self, path: impl Into<PathBuf>) -> FanOut<bool> {
        self.fan_out_path(path.into(), |s, p| async move { s.is_file(&p).await })
    }

    /// [`RemoteOps::is_dir`] on one session per key
    pub fn is_dir(&self, path: impl Into<PathBuf>) -> FanOut<bool> {
        self.fan_out_path(path.into(), |s, p| async move { s.is_dir(&p).await })
    }

    /// [`RemoteOps::is_symlink`] on one session per key
    pub fn is_symlink(&self, path: impl Into<PathBuf>) -> FanOut<bool> {
        self.fan_out_path(path.into(), |s, p| async move { s.is_symlink(&p).await })
    }

    /// [`RemoteOps::stat`] on one session per key
    pub fn stat(&self, path: impl Into<PathBuf>) -> FanOut<FileMetadata> {
        self.fan_out_path(path.into(), |s, p| async move { s.stat(&p).await })
    }

    /// [`RemoteOps::file_size`] on one session per key
    pub fn file_size(&self, path: impl Into<PathBuf>) -> FanOut<u64> {
        self.fan_out_path(path.into(), |s, p| async move { s.file_size(&p).await })
    }

    /// [`RemoteOps::list_dir`] on one session per key
    pub fn list_dir(&self, path: impl Into<PathBuf>) -> FanOut<Vec<DirEntry>> {
        self.fan_out_path(path.into(), |s, p| async move { s.list_dir(&p).await })
    }

    /// [`RemoteOps::read`] on one session per key
    pub fn read(&self, path: impl Into<PathBuf>) -> FanOut<Bytes> {
        self.fan_out_path(path.into(), |s, p| async move { s.read(&p).await })
    }

    /// [`RemoteOps::read_to_string`] on one session per key
    pub fn read_to_string(&self, path: impl Into<PathBuf>) -> FanOut<String> {
        self.fan_out_path(path.into(), |s, p| async move { s.read_to_string(&p).await })
    }

    /// [`RemoteOps::write`] on one session per key
    pub fn write(&self, path: impl Into<PathBuf>, content: Bytes) -> FanOut<()> {
        self.fan_out_path(path.into(), move |s, p| {
            let content = content.clone();
            async move { s.write(&p, content).await }
        })
    }

    /// [`RemoteOps::append`] on one session per key
    pub fn append(&self, path: impl Into<PathBuf>, content: Bytes) -> FanOut<()> {
        self.fan_out_path(path.into(), move |s, p| {
            let content = content.clone();
            async move { s.append(&p, content).await }
        })
    }

    /// [`RemoteOps::create_dir`] on one session per key
    pub fn create_dir(&self, path: impl Into<PathBuf>) -> FanOut<()> {
        self.fan_out_path(path.into(), |s, p| async move { s.create_dir(&p).await })
    }

    /// [`RemoteOps::create_dir_all`] on one session per key
    pub fn create_dir_all(&self, path: impl Into<PathBuf>) -> FanOut<()> {
        self.fan_out_path(path.into(), |s, p| async move { s.create_dir_all(&p).await })
    }

    /// [`RemoteOps::remove_file`] on one session per key
    pub fn remove_file(&self, path: impl Into<PathBuf>) -> FanOut<()> {
        self.fan_out_path(path.into(), |s, p| async move { s.remove_file(&p).await })
    }

    /// [`RemoteOps::remove_dir`] on one session per key
    pub fn remove_dir(&self, path: impl Into<PathBuf>) -> FanOut<()> {
        self.fan_out_path(path.into(), |s, p| async move { s.remove_dir(&p).await })
    }

    /// [`RemoteOps::remove_dir_all`] on one session per key
    pub fn remove_dir_all(&self, path: impl Into<PathBuf>) -> FanOut<()> {
        self.fan_out_path(path.into(), |s, p| async move { s.remove_dir_all(&p).await })
    }

    /// [`RemoteOps::rename`] on one session per key
    pub fn rename(&self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> FanOut<()> {
        let to = to.into();
        self.fan_out_path(from.into(), move |s, from| {
            let to = to.clone();
            async move { s.rename(&from, &to).await }
        })
    }

    /// [`RemoteOps::canonicalize`] on one session per key
    pub fn canonicalize(&self, path: impl Into<PathBuf>) -> FanOut<PathBuf> {
        self.fan_out_path(path.into(), |s, p| async move { s.canonicalize(&p).await })
    }

    /// [`RemoteOps::set_permissions`] on one session per key
    pub fn set_permissions(&self, path: impl Into<PathBuf>, mode: u32) -> FanOut<()> {
        self.fan_out_path(path.into(), move |s, p| async move { s.set_permissions(&p, mode).await })
    }

    /// [`RemoteOps::run`] on one session per key
    pub fn run(&self, command: Vec<String>) -> FanOut<ProcessOutput> {
        self.fan_out_with(move |s| {
            let command = command.clone();
            async move { s.run(command).await }
        })
    }

    /// [`RemoteOps::upload`] to one session per key
    pub fn upload(&self, local: impl Into<PathBuf>, remote: impl Into<PathBuf>) -> FanOut<u64> {
        let local = local.into();
        self.fan_out_path(remote.into(), move |s, remote| {
            let local = local.clone();
            async move { s.upload(&local, &remote).await }
        })
    }

    /// [`RemoteOps::download`] from one session per key.
    ///
    /// Every key writes to the same local path; use
    /// [`MultiConnection::fan_out_with`] to pick a path per key.
    pub fn download(&self, remote: impl Into<PathBuf>, local: impl Into<PathBuf>) -> FanOut<u64> {
        let local = local.into();
        self.fan_out_path(remote.into(), move |s, remote| {
            let local = local.clone();
            async move { s.download(&remote, &local).await }
        })
    }
}

impl Clone for MultiConnection {
    fn clone(&self) -> Self {
        let pools = self.pools.read();
        let by_key = pools
            .by_key
            .iter()
            .map(|(key, pool)| (key.clone(), Arc::new(pool.shallow_copy())))
            .collect();
        Self {
            pools: RwLock::new(Pools {
                order: pools.order.clone(),
                by_key,
            }),
            factory: Arc::clone(&self.factory),
            thread_safe: self.thread_safe,
        }
    }
}

impl Add for MultiConnection {
    type Output = MultiConnection;

    fn add(self, other: MultiConnection) -> MultiConnection {
        self.merge(other)
    }
}

/// JSON form of the descriptor. A descriptor JSON cannot hold (such as a
/// non UTF-8 identity file path) falls back to the `Debug` summary.
impl fmt::Display for MultiConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json_string() {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

impl fmt::Debug for MultiConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: Vec<(String, usize)> = self
            .snapshot()
            .into_iter()
            .map(|(key, pool)| (key, pool.len()))
            .collect();
        f.debug_struct("MultiConnection")
            .field("pools", &sizes)
            .field("thread_safe", &self.thread_safe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use hostlink_proto::ConnectionKind;
    use hostlink_ssh::{HostConfig, MockTransport};

    const HOSTS: &str = "\
Host h1
  HostName 10.0.0.1
  User alice

Host h2
  HostName 10.0.0.2
  User bob
  Port 2200
";

    fn factory(transport: &MockTransport) -> Arc<SessionFactory> {
        Arc::new(
            SessionFactory::new()
                .with_hosts(HostConfig::parse(HOSTS))
                .with_remote_transport(Arc::new(transport.clone())),
        )
    }

    fn multi(keys: &[&str]) -> (MultiConnection, MockTransport) {
        let transport = MockTransport::new();
        let multi = MultiConnection::open(keys.iter().copied(), factory(&transport)).unwrap();
        (multi, transport)
    }

    #[test]
    fn test_open_groups_repeated_keys() {
        let (multi, transport) = multi(&["h1", "h1", "h2"]);

        assert_eq!(multi.keys(), vec!["h1", "h2"]);
        assert_eq!(multi.len(), 2);
        assert_eq!(multi.len_all(), 3);
        assert_eq!(multi.keys_all(), vec!["h1", "h1", "h2"]);
        assert_eq!(multi.items_all().len(), multi.len_all());
        assert_eq!(transport.connect_count(), 0);
    }

    #[test]
    fn test_unknown_key_fails_to_open() {
        let transport = MockTransport::new();
        let result = MultiConnection::open(["h1", "nowhere"], factory(&transport));
        assert!(matches!(result, Err(HostlinkError::Configuration(_))));
    }

    #[test]
    fn test_get_rotates_and_missing_key() {
        let (multi, _) = multi(&["h1", "h1"]);
        let sessions = multi.get_all("h1").unwrap();

        assert_eq!(multi.get("h1").unwrap(), sessions[0]);
        assert_eq!(multi.get("h1").unwrap(), sessions[1]);
        assert_eq!(multi.get("h1").unwrap(), sessions[0]);
        assert!(matches!(multi.get("h9"), Err(HostlinkError::KeyNotFound { .. })));

        let fallback = multi.get_all("h1").unwrap().remove(1);
        assert_eq!(multi.get_or("h9", fallback.clone()), fallback);
    }

    #[test]
    fn test_insert_appends() {
        let (multi, _) = multi(&["h1"]);
        let extra = multi.factory().open("h1").unwrap();

        multi.insert("h1", extra.clone());
        assert_eq!(multi.len(), 1);
        assert_eq!(multi.get_all("h1").unwrap().len(), 2);
        assert_eq!(multi.get_all("h1").unwrap()[1], extra);

        multi.push(multi.factory().open("h2").unwrap());
        assert_eq!(multi.keys(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn test_remove_closes_and_prunes() {
        let (multi, _) = multi(&["h1", "h1", "h2"]);
        let first = multi.get_all("h1").unwrap()[0].clone();

        multi.remove("h1").await.unwrap();
        assert!(first.status().is_closed());
        assert_eq!(multi.get_all("h1").unwrap().len(), 1);

        multi.remove("h1").await.unwrap();
        assert!(!multi.contains_key("h1"));
        assert_eq!(multi.keys(), vec!["h2"]);
        assert!(matches!(multi.remove("h1").await, Err(HostlinkError::KeyNotFound { .. })));
    }

    #[test]
    fn test_pop_variants() {
        let (multi, _) = multi(&["h1", "h2", "h2"]);

        let (key, session) = multi.pop_item().unwrap();
        assert_eq!(key, "h2");
        assert!(!session.status().is_closed());
        assert_eq!(multi.len_all(), 2);

        let (key, sessions) = multi.pop_item_all().unwrap();
        assert_eq!(key, "h2");
        assert_eq!(sessions.len(), 1);

        assert_eq!(multi.pop_all("h1").unwrap().len(), 1);
        assert!(multi.is_empty());
        assert!(multi.pop_item().is_none());
    }

    #[test]
    fn test_values_rotate_once_per_key() {
        let (multi, _) = multi(&["h1", "h1", "h2"]);
        let h1 = multi.get_all("h1").unwrap();

        let first = multi.values();
        let second = multi.values();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], h1[0]);
        assert_eq!(second[0], h1[1]);
        assert_eq!(first[1], second[1]);
    }

    #[test]
    fn test_merge_concatenates_pools() {
        let transport = MockTransport::new();
        let factory = factory(&transport);
        let a = MultiConnection::open(["h1"], Arc::clone(&factory)).unwrap();
        let b = MultiConnection::open(["h1", "h2"], factory).unwrap();

        let merged = a + b;
        assert_eq!(merged.keys(), vec!["h1", "h2"]);
        assert_eq!(merged.get_all("h1").unwrap().len(), 2);
        assert_eq!(merged.get_all("h2").unwrap().len(), 1);
    }

    #[test]
    fn test_clone_is_shallow_and_deep_copy_is_not() {
        let (multi, _) = multi(&["h1", "h2"]);

        let shallow = multi.clone();
        assert_eq!(shallow.values_all(), multi.values_all());
        shallow.pop("h1").unwrap();
        assert!(multi.contains_key("h1"));

        let deep = multi.deep_copy().unwrap();
        assert_eq!(deep.to_descriptor(), multi.to_descriptor());
        assert_ne!(deep.get("h1").unwrap(), multi.get("h1").unwrap());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let (multi, transport) = multi(&["h1", "h1", "h2"]);
        multi.insert("laptop", multi.factory().open_local("laptop").unwrap());

        let text = multi.to_string();
        let restored = MultiConnection::from_json_str(&text, factory(&transport)).unwrap();
        assert_eq!(restored.keys(), vec!["h1", "h2", "laptop"]);
        assert_eq!(restored.to_descriptor().pool_sizes(), multi.to_descriptor().pool_sizes());
        assert_eq!(restored.get("laptop").unwrap().kind(), ConnectionKind::Local);

        let bytes = multi.to_bytes().unwrap();
        let restored = MultiConnection::from_bytes(&bytes, factory(&transport)).unwrap();
        assert_eq!(restored.to_descriptor(), multi.to_descriptor());
        assert!(restored.values_all().iter().all(|s| !s.is_connected()));
    }

    #[test]
    fn test_add_hosts_registers_aliases() {
        let (multi, _) = multi(&["h1"]);
        multi
            .add_hosts([HostEntry {
                alias: "h3".into(),
                hostname: Some("10.0.0.3".into()),
                user: Some("carol".into()),
                ..Default::default()
            }])
            .unwrap();

        assert_eq!(multi.keys(), vec!["h1", "h3"]);
        assert!(multi.factory().available_hosts().contains(&"h3".to_string()));
    }

    #[test]
    fn test_builder_overrides() {
        let transport = MockTransport::new();
        let multi = MultiConnection::builder(factory(&transport))
            .thread_safe(true)
            .host("h1")
            .local("here")
            .host_with("h2", SessionOptions::default().with_thread_safe(false))
            .build()
            .unwrap();

        assert!(multi.get("h1").unwrap().is_thread_safe());
        assert_eq!(multi.get("here").unwrap().kind(), ConnectionKind::Local);
        assert!(!multi.get("h2").unwrap().is_thread_safe());
    }

    #[tokio::test]
    async fn test_fan_out_one_session_per_key() {
        let (multi, transport) = multi(&["h1", "h1", "h2"]);
        transport.insert_file("/etc/motd", "hello");

        let results: Vec<(String, bool)> = multi.exists("/etc/motd").try_collect().await.unwrap();
        assert_eq!(results, vec![("h1".to_string(), true), ("h2".to_string(), true)]);
        assert_eq!(transport.operation_count(), 2);

        // The next fan-out lands on the second h1 session
        let h1 = multi.get_all("h1").unwrap();
        multi.read("/etc/motd").try_collect::<Vec<_>>().await.unwrap();
        assert!(h1[1].is_connected());
    }

    #[tokio::test]
    async fn test_clear_closes_everything() {
        let (multi, _) = multi(&["h1", "h2"]);
        multi.connect_all().await.unwrap();
        let sessions = multi.values_all();
        assert!(sessions.iter().all(Session::is_connected));

        multi.clear().await;
        assert!(multi.is_empty());
        assert!(sessions.iter().all(|s| s.status().is_closed()));
    }

    #[test]
    fn test_key_leaves_with_its_last_session() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (multi, _) = multi(&[]);
        let multi = Arc::new(multi);
        let session = multi.factory().open("h1").unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let churn = {
            let multi = Arc::clone(&multi);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    multi.insert("h1", session.clone());
                    multi.pop("h1").unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        while !done.load(Ordering::SeqCst) {
            match multi.get("h1") {
                Ok(_) | Err(HostlinkError::KeyNotFound { .. }) => {}
                Err(e) => panic!("registered key without sessions: {:?}", e),
            }
        }
        churn.join().unwrap();
        assert!(!multi.contains_key("h1"));
        assert!(multi.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_display_falls_back_when_json_fails() {
        use hostlink_ssh::Credentials;
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (multi, _) = multi(&["h1"]);
        let identity = PathBuf::from(OsStr::from_bytes(b"/home/u/.ssh/id_\xff"));
        let credentials = Credentials::remote("u", "10.0.0.5").with_identity_file(identity);
        multi.insert("odd", multi.factory().open_credentials("odd", credentials).unwrap());

        assert!(matches!(multi.to_json_string(), Err(HostlinkError::Protocol(_))));
        let text = multi.to_string();
        assert!(text.contains("MultiConnection"));
        assert!(text.contains("odd"));
    }

    #[tokio::test]
    async fn test_fan_out_keys_fixed_at_creation() {
        let (multi, transport) = multi(&["h1"]);
        let fan_out = multi.exists("/");
        multi.push(multi.factory().open("h2").unwrap());
        assert_eq!(transport.operation_count(), 0);

        let keys: Vec<String> = fan_out.map_ok(|(key, _)| key).try_collect().await.unwrap();
        assert_eq!(keys, vec!["h1"]);
    }
}
