//! Transport for the machine this process runs on

use crate::transport::{shell_command, Channel, ConnectionInfo, Credentials, Transport, TransportType};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use hostlink_proto::{DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput};
use std::fs::Metadata;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Transport that executes operations against the local filesystem and shell
#[derive(Debug, Default, Clone)]
pub struct LocalTransport;

impl LocalTransport {
    /// Create a new local transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn Channel>, TransportError> {
        Ok(Arc::new(LocalConnection::new()))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Local
    }
}

/// Local "connection"; never fails at the connection level
#[derive(Debug)]
pub struct LocalConnection {
    open: AtomicBool,
}

impl LocalConnection {
    /// Create an open local connection
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for LocalConnection {
    async fn execute(&self, operation: &Operation) -> Result<OpOutput, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connection("local connection is closed".to_string()));
        }
        debug!("local: {}", operation);
        execute_local(operation).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "localhost".to_string(),
            port: 0,
            username: std::env::var("USER").unwrap_or_default(),
            transport_type: TransportType::Local,
        }
    }
}

async fn execute_local(operation: &Operation) -> Result<OpOutput, TransportError> {
    let fail = |path: &Path| {
        let context = path.display().to_string();
        move |e: std::io::Error| TransportError::from_local_io(e, context)
    };

    match operation {
        Operation::Exists { path } => Ok(OpOutput::Bool(probe(fs::metadata(path).await, path)?.is_some())),
        Operation::IsFile { path } => Ok(OpOutput::Bool(
            probe(fs::metadata(path).await, path)?.map_or(false, |m| m.is_file()),
        )),
        Operation::IsDir { path } => Ok(OpOutput::Bool(
            probe(fs::metadata(path).await, path)?.map_or(false, |m| m.is_dir()),
        )),
        Operation::IsSymlink { path } => Ok(OpOutput::Bool(
            probe(fs::symlink_metadata(path).await, path)?.map_or(false, |m| m.file_type().is_symlink()),
        )),
        Operation::Stat { path, follow_symlinks } => {
            let metadata = if *follow_symlinks {
                fs::metadata(path).await
            } else {
                fs::symlink_metadata(path).await
            }
            .map_err(fail(path))?;
            Ok(OpOutput::Metadata(to_metadata(&metadata)))
        }
        Operation::ListDir { path } => {
            let mut reader = fs::read_dir(path).await.map_err(fail(path))?;
            let mut entries = Vec::new();
            while let Some(entry) = reader.next_entry().await.map_err(fail(path))? {
                let entry_path = entry.path();
                let metadata = fs::symlink_metadata(&entry_path).await.map_err(fail(&entry_path))?;
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry_path,
                    metadata: to_metadata(&metadata),
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(OpOutput::Entries(entries))
        }
        Operation::ReadFile { path } => {
            let content = fs::read(path).await.map_err(fail(path))?;
            Ok(OpOutput::Content(Bytes::from(content)))
        }
        Operation::WriteFile { path, content, append } => {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .append(*append)
                .truncate(!*append)
                .open(path)
                .await
                .map_err(fail(path))?;
            file.write_all(content).await.map_err(fail(path))?;
            file.flush().await.map_err(fail(path))?;
            Ok(OpOutput::Transferred(content.len() as u64))
        }
        Operation::CreateDir { path, mode, parents } => {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(*parents).mode(*mode);
            builder.create(path).await.map_err(fail(path))?;
            Ok(OpOutput::Unit)
        }
        Operation::RemoveFile { path } => {
            fs::remove_file(path).await.map_err(fail(path))?;
            Ok(OpOutput::Unit)
        }
        Operation::RemoveDir { path } => {
            fs::remove_dir(path).await.map_err(fail(path))?;
            Ok(OpOutput::Unit)
        }
        Operation::RemoveDirAll { path } => {
            fs::remove_dir_all(path).await.map_err(fail(path))?;
            Ok(OpOutput::Unit)
        }
        Operation::Rename { from, to } => {
            fs::rename(from, to).await.map_err(fail(from))?;
            Ok(OpOutput::Unit)
        }
        Operation::Canonicalize { path } => Ok(OpOutput::Path(fs::canonicalize(path).await.map_err(fail(path))?)),
        Operation::SetPermissions { path, mode } => {
            fs::set_permissions(path, std::fs::Permissions::from_mode(*mode))
                .await
                .map_err(fail(path))?;
            Ok(OpOutput::Unit)
        }
        Operation::Run { command, env, cwd, stdin } => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(shell_command(command))
                .envs(env)
                .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            if let Some(dir) = cwd {
                cmd.current_dir(dir);
            }

            let mut child = cmd.spawn().map_err(|e| TransportError::from_local_io(e, "sh"))?;
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input)
                    .await
                    .map_err(|e| TransportError::from_local_io(e, "stdin"))?;
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| TransportError::from_local_io(e, "sh"))?;
            Ok(OpOutput::Process(ProcessOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: Bytes::from(output.stdout),
                stderr: Bytes::from(output.stderr),
            }))
        }
        Operation::Upload { local, remote } => {
            let copied = fs::copy(local, remote).await.map_err(fail(local))?;
            Ok(OpOutput::Transferred(copied))
        }
        Operation::Download { remote, local } => {
            let copied = fs::copy(remote, local).await.map_err(fail(remote))?;
            Ok(OpOutput::Transferred(copied))
        }
    }
}

fn probe(result: std::io::Result<Metadata>, path: &Path) -> Result<Option<Metadata>, TransportError> {
    match result {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TransportError::from_local_io(e, path.display())),
    }
}

fn to_metadata(metadata: &Metadata) -> FileMetadata {
    FileMetadata {
        size: metadata.len(),
        mode: metadata.permissions().mode() & 0o7777,
        modified: metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs()),
        is_dir: metadata.is_dir(),
        is_symlink: metadata.file_type().is_symlink(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_proto::RemoteErrorKind;
    use tempfile::TempDir;

    async fn exec(op: Operation) -> Result<OpOutput, TransportError> {
        LocalConnection::new().execute(&op).await
    }

    #[tokio::test]
    async fn test_write_read_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");

        exec(Operation::WriteFile {
            path: path.clone(),
            content: Bytes::from_static(b"hello"),
            append: false,
        })
        .await
        .unwrap();
        exec(Operation::WriteFile {
            path: path.clone(),
            content: Bytes::from_static(b" world"),
            append: true,
        })
        .await
        .unwrap();

        let output = exec(Operation::ReadFile { path }).await.unwrap();
        assert_eq!(output, OpOutput::Content(Bytes::from_static(b"hello world")));
    }

    #[tokio::test]
    async fn test_predicates() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(exec(Operation::IsFile { path: file.clone() }).await.unwrap(), OpOutput::Bool(true));
        assert_eq!(exec(Operation::IsDir { path: file.clone() }).await.unwrap(), OpOutput::Bool(false));
        assert_eq!(
            exec(Operation::Exists { path: dir.path().join("missing") }).await.unwrap(),
            OpOutput::Bool(false)
        );
        assert_eq!(
            exec(Operation::IsSymlink { path: file }).await.unwrap(),
            OpOutput::Bool(false)
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_operation_error() {
        let dir = TempDir::new().unwrap();
        let err = exec(Operation::ReadFile { path: dir.path().join("nope") })
            .await
            .unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::NotFound));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_create_list_remove_dirs() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");

        exec(Operation::CreateDir {
            path: nested.clone(),
            mode: 0o755,
            parents: true,
        })
        .await
        .unwrap();

        let OpOutput::Entries(entries) = exec(Operation::ListDir { path: dir.path().join("a") }).await.unwrap()
        else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].metadata.is_dir);

        let err = exec(Operation::RemoveDir { path: dir.path().join("a") }).await.unwrap_err();
        assert!(!err.is_transient());

        exec(Operation::RemoveDirAll { path: dir.path().join("a") }).await.unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_run_with_env_cwd_stdin() {
        let dir = TempDir::new().unwrap();
        let mut env = std::collections::HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());

        let output = exec(Operation::Run {
            command: vec!["echo $GREETING; pwd; cat".to_string()],
            env,
            cwd: Some(dir.path().to_path_buf()),
            stdin: Some(Bytes::from_static(b"piped")),
        })
        .await
        .unwrap();

        let OpOutput::Process(process) = output else {
            panic!("expected process output");
        };
        assert!(process.success());
        let stdout = process.stdout_lossy();
        assert!(stdout.starts_with("hi\n"));
        assert!(stdout.ends_with("piped"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let output = exec(Operation::run(["sh", "-c", "exit 3"])).await.unwrap();
        let OpOutput::Process(process) = output else {
            panic!("expected process output");
        };
        assert_eq!(process.exit_code, 3);
    }

    #[tokio::test]
    async fn test_closed_connection_is_transient_failure() {
        let conn = LocalConnection::new();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        let err = conn.execute(&Operation::Exists { path: "/".into() }).await.unwrap_err();
        assert!(err.is_transient());
    }
}
