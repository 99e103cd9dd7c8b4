//! In-memory transport for tests
//!
//! [`MockTransport`] serves operations from an in-memory filesystem shared
//! by every channel it opens, and can be told to fail the next N connects or
//! operations with a connection-level error.

use crate::transport::{shell_command, Channel, ConnectionInfo, Credentials, Transport, TransportType};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use hostlink_proto::{DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput, RemoteErrorKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockFs {
    files: BTreeMap<PathBuf, Bytes>,
    dirs: BTreeSet<PathBuf>,
}

#[derive(Default)]
struct MockState {
    fs: Mutex<MockFs>,
    failing_connects: AtomicU32,
    failing_operations: AtomicU32,
    connects: AtomicU32,
    operations: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
    log: Mutex<Vec<String>>,
}

/// Scriptable transport backed by an in-memory filesystem
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connects", &self.connect_count())
            .field("operations", &self.operation_count())
            .finish()
    }
}

impl MockTransport {
    /// Create a transport with an empty filesystem containing `/`
    pub fn new() -> Self {
        let transport = Self::default();
        transport.state.fs.lock().dirs.insert(PathBuf::from("/"));
        transport
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` operations with a connection reset, dropping the channel
    pub fn fail_next_operations(&self, n: u32) {
        self.state.failing_operations.store(n, Ordering::SeqCst);
    }

    /// Delay every connect
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of operations that reached a channel, failed ones included
    pub fn operation_count(&self) -> u32 {
        self.state.operations.load(Ordering::SeqCst)
    }

    /// Names of executed operations, in order
    pub fn operation_log(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    /// Create a file and its parent directories
    pub fn insert_file(&self, path: impl Into<PathBuf>, content: impl Into<Bytes>) {
        let path = path.into();
        let mut fs = self.state.fs.lock();
        for ancestor in path.ancestors().skip(1) {
            fs.dirs.insert(ancestor.to_path_buf());
        }
        fs.files.insert(path, content.into());
    }

    /// Create a directory and its parents
    pub fn insert_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut fs = self.state.fs.lock();
        for ancestor in path.ancestors() {
            fs.dirs.insert(ancestor.to_path_buf());
        }
    }

    /// Content of a file, if present
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Bytes> {
        self.state.fs.lock().files.get(path.as_ref()).cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Channel>, TransportError> {
        credentials.validate()?;

        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.state.failing_connects) {
            return Err(TransportError::Connection("connection refused".to_string()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(true),
            host: credentials.host.clone().unwrap_or_else(|| "localhost".to_string()),
            username: credentials.username.clone().unwrap_or_default(),
        }))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Mock
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct MockChannel {
    state: Arc<MockState>,
    connected: AtomicBool,
    host: String,
    username: String,
}

#[async_trait]
impl Channel for MockChannel {
    async fn execute(&self, operation: &Operation) -> Result<OpOutput, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connection("channel closed".to_string()));
        }

        self.state.operations.fetch_add(1, Ordering::SeqCst);
        self.state.log.lock().push(operation.name().to_string());

        if take_one(&self.state.failing_operations) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Connection("connection reset by peer".to_string()));
        }

        let mut fs = self.state.fs.lock();
        fs.execute(operation)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.host.clone(),
            port: 22,
            username: self.username.clone(),
            transport_type: TransportType::Mock,
        }
    }
}

impl MockFs {
    fn execute(&mut self, operation: &Operation) -> Result<OpOutput, TransportError> {
        match operation {
            Operation::Exists { path } => Ok(OpOutput::Bool(self.files.contains_key(path) || self.dirs.contains(path))),
            Operation::IsFile { path } => Ok(OpOutput::Bool(self.files.contains_key(path))),
            Operation::IsDir { path } => Ok(OpOutput::Bool(self.dirs.contains(path))),
            Operation::IsSymlink { .. } => Ok(OpOutput::Bool(false)),
            Operation::Stat { path, .. } => Ok(OpOutput::Metadata(self.metadata(path)?)),
            Operation::ListDir { path } => {
                if !self.dirs.contains(path) {
                    return Err(not_found(path));
                }
                let children: BTreeSet<PathBuf> = self
                    .files
                    .keys()
                    .chain(self.dirs.iter())
                    .filter(|p| p.parent() == Some(path.as_path()))
                    .cloned()
                    .collect();
                let mut entries = Vec::new();
                for child in children {
                    entries.push(DirEntry {
                        name: child
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        metadata: self.metadata(&child)?,
                        path: child,
                    });
                }
                Ok(OpOutput::Entries(entries))
            }
            Operation::ReadFile { path } => self
                .files
                .get(path)
                .cloned()
                .map(OpOutput::Content)
                .ok_or_else(|| not_found(path)),
            Operation::WriteFile { path, content, append } => {
                self.require_parent(path)?;
                let data = match (append, self.files.get(path)) {
                    (true, Some(existing)) => {
                        let mut joined = existing.to_vec();
                        joined.extend_from_slice(content);
                        Bytes::from(joined)
                    }
                    _ => content.clone(),
                };
                self.files.insert(path.clone(), data);
                Ok(OpOutput::Transferred(content.len() as u64))
            }
            Operation::CreateDir { path, parents, .. } => {
                if *parents {
                    for ancestor in path.ancestors() {
                        self.dirs.insert(ancestor.to_path_buf());
                    }
                    return Ok(OpOutput::Unit);
                }
                if self.dirs.contains(path) || self.files.contains_key(path) {
                    return Err(TransportError::remote(
                        RemoteErrorKind::AlreadyExists,
                        path.display().to_string(),
                    ));
                }
                self.require_parent(path)?;
                self.dirs.insert(path.clone());
                Ok(OpOutput::Unit)
            }
            Operation::RemoveFile { path } => self
                .files
                .remove(path)
                .map(|_| OpOutput::Unit)
                .ok_or_else(|| not_found(path)),
            Operation::RemoveDir { path } => {
                if !self.dirs.contains(path) {
                    return Err(not_found(path));
                }
                let occupied = self
                    .files
                    .keys()
                    .chain(self.dirs.iter())
                    .any(|p| p.parent() == Some(path.as_path()));
                if occupied {
                    return Err(TransportError::remote(
                        RemoteErrorKind::DirectoryNotEmpty,
                        path.display().to_string(),
                    ));
                }
                self.dirs.remove(path);
                Ok(OpOutput::Unit)
            }
            Operation::RemoveDirAll { path } => {
                if !self.dirs.contains(path) {
                    return Err(not_found(path));
                }
                self.files.retain(|p, _| !p.starts_with(path));
                self.dirs.retain(|p| !p.starts_with(path));
                Ok(OpOutput::Unit)
            }
            Operation::Rename { from, to } => {
                let content = self.files.remove(from).ok_or_else(|| not_found(from))?;
                self.files.insert(to.clone(), content);
                Ok(OpOutput::Unit)
            }
            Operation::Canonicalize { path } => {
                if self.files.contains_key(path) || self.dirs.contains(path) {
                    Ok(OpOutput::Path(path.clone()))
                } else {
                    Err(not_found(path))
                }
            }
            Operation::SetPermissions { path, .. } => {
                self.metadata(path)?;
                Ok(OpOutput::Unit)
            }
            Operation::Run { command, stdin, .. } => {
                // Echoes the command line, followed by stdin
                let mut stdout = shell_command(command).into_bytes();
                if let Some(input) = stdin {
                    stdout.push(b'\n');
                    stdout.extend_from_slice(input);
                }
                Ok(OpOutput::Process(ProcessOutput {
                    exit_code: 0,
                    stdout: Bytes::from(stdout),
                    stderr: Bytes::new(),
                }))
            }
            Operation::Upload { local, remote } => {
                let content = std::fs::read(local).map_err(|e| TransportError::from_local_io(e, local.display()))?;
                let size = content.len() as u64;
                self.files.insert(remote.clone(), Bytes::from(content));
                Ok(OpOutput::Transferred(size))
            }
            Operation::Download { remote, local } => {
                let content = self.files.get(remote).ok_or_else(|| not_found(remote))?;
                std::fs::write(local, content).map_err(|e| TransportError::from_local_io(e, local.display()))?;
                Ok(OpOutput::Transferred(content.len() as u64))
            }
        }
    }

    fn metadata(&self, path: &Path) -> Result<FileMetadata, TransportError> {
        if let Some(content) = self.files.get(path) {
            return Ok(FileMetadata {
                size: content.len() as u64,
                mode: 0o644,
                modified: 0,
                is_dir: false,
                is_symlink: false,
            });
        }
        if self.dirs.contains(path) {
            return Ok(FileMetadata {
                size: 0,
                mode: 0o755,
                modified: 0,
                is_dir: true,
                is_symlink: false,
            });
        }
        Err(not_found(path))
    }

    fn require_parent(&self, path: &Path) -> Result<(), TransportError> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !self.dirs.contains(parent) => Err(not_found(parent)),
            _ => Ok(()),
        }
    }
}

fn not_found(path: &Path) -> TransportError {
    TransportError::remote(RemoteErrorKind::NotFound, path.display().to_string())
}
