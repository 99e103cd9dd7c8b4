//! Typed file, path and process operations
//!
//! [`RemoteOps`] is the fixed set of operations a session offers. Each
//! method builds one [`Operation`], runs it through [`RemoteOps::execute`]
//! and unpacks the answer.
//!
//! `append`, `run` and `rename` are not idempotent. When a connection drops
//! after the host applied one of them, the retry runs it again.

use crate::{Result, Session};
use async_trait::async_trait;
use bytes::Bytes;
use hostlink_proto::{DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput, ProtocolError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default mode for created directories
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Operations available on a host
#[async_trait]
pub trait RemoteOps: Send + Sync {
    /// Execute a raw operation
    async fn execute(&self, operation: Operation) -> Result<OpOutput>;

    /// Test whether a path exists
    async fn exists(&self, path: &Path) -> Result<bool> {
        let op = Operation::Exists { path: path.to_path_buf() };
        expect_bool(&op, self.execute(op.clone()).await?)
    }

    /// Test whether a path is a regular file
    async fn is_file(&self, path: &Path) -> Result<bool> {
        let op = Operation::IsFile { path: path.to_path_buf() };
        expect_bool(&op, self.execute(op.clone()).await?)
    }

    /// Test whether a path is a directory
    async fn is_dir(&self, path: &Path) -> Result<bool> {
        let op = Operation::IsDir { path: path.to_path_buf() };
        expect_bool(&op, self.execute(op.clone()).await?)
    }

    /// Test whether a path is a symbolic link
    async fn is_symlink(&self, path: &Path) -> Result<bool> {
        let op = Operation::IsSymlink { path: path.to_path_buf() };
        expect_bool(&op, self.execute(op.clone()).await?)
    }

    /// Metadata of a path, following symlinks
    async fn stat(&self, path: &Path) -> Result<FileMetadata> {
        let op = Operation::Stat {
            path: path.to_path_buf(),
            follow_symlinks: true,
        };
        match self.execute(op.clone()).await? {
            OpOutput::Metadata(metadata) => Ok(metadata),
            other => Err(unexpected(&op, "metadata", &other)),
        }
    }

    /// Size of a file in bytes
    async fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(self.stat(path).await?.size)
    }

    /// List a directory
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let op = Operation::ListDir { path: path.to_path_buf() };
        match self.execute(op.clone()).await? {
            OpOutput::Entries(entries) => Ok(entries),
            other => Err(unexpected(&op, "entries", &other)),
        }
    }

    /// Read a whole file
    async fn read(&self, path: &Path) -> Result<Bytes> {
        let op = Operation::ReadFile { path: path.to_path_buf() };
        match self.execute(op.clone()).await? {
            OpOutput::Content(content) => Ok(content),
            other => Err(unexpected(&op, "content", &other)),
        }
    }

    /// Read a whole file as UTF-8, replacing invalid sequences
    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let content = self.read(path).await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Create or truncate a file and write `content`
    async fn write(&self, path: &Path, content: Bytes) -> Result<()> {
        let op = Operation::WriteFile {
            path: path.to_path_buf(),
            content,
            append: false,
        };
        self.execute(op).await.map(|_| ())
    }

    /// Append `content` to a file, creating it if missing
    async fn append(&self, path: &Path, content: Bytes) -> Result<()> {
        let op = Operation::WriteFile {
            path: path.to_path_buf(),
            content,
            append: true,
        };
        self.execute(op).await.map(|_| ())
    }

    /// Create one directory
    async fn create_dir(&self, path: &Path) -> Result<()> {
        let op = Operation::CreateDir {
            path: path.to_path_buf(),
            mode: DEFAULT_DIR_MODE,
            parents: false,
        };
        self.execute(op).await.map(|_| ())
    }

    /// Create a directory and any missing parents
    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let op = Operation::CreateDir {
            path: path.to_path_buf(),
            mode: DEFAULT_DIR_MODE,
            parents: true,
        };
        self.execute(op).await.map(|_| ())
    }

    /// Remove a file
    async fn remove_file(&self, path: &Path) -> Result<()> {
        self.execute(Operation::RemoveFile { path: path.to_path_buf() })
            .await
            .map(|_| ())
    }

    /// Remove an empty directory
    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.execute(Operation::RemoveDir { path: path.to_path_buf() })
            .await
            .map(|_| ())
    }

    /// Remove a directory tree
    async fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.execute(Operation::RemoveDirAll { path: path.to_path_buf() })
            .await
            .map(|_| ())
    }

    /// Rename or move a path
    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let op = Operation::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        };
        self.execute(op).await.map(|_| ())
    }

    /// Resolve a path to its absolute canonical form
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        let op = Operation::Canonicalize { path: path.to_path_buf() };
        match self.execute(op.clone()).await? {
            OpOutput::Path(path) => Ok(path),
            other => Err(unexpected(&op, "path", &other)),
        }
    }

    /// Change permission bits
    async fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        let op = Operation::SetPermissions {
            path: path.to_path_buf(),
            mode,
        };
        self.execute(op).await.map(|_| ())
    }

    /// Run a command through the host's shell.
    ///
    /// A single element is interpreted by the shell as written; several
    /// elements are quoted as separate arguments. A non-zero exit status is
    /// reported in the output, not as an error.
    async fn run(&self, command: Vec<String>) -> Result<ProcessOutput> {
        self.run_with(command, HashMap::new(), None, None).await
    }

    /// Run a command with environment, working directory and stdin
    async fn run_with(
        &self,
        command: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
        stdin: Option<Bytes>,
    ) -> Result<ProcessOutput> {
        let op = Operation::Run {
            command,
            env,
            cwd,
            stdin,
        };
        match self.execute(op.clone()).await? {
            OpOutput::Process(output) => Ok(output),
            other => Err(unexpected(&op, "process", &other)),
        }
    }

    /// Copy a local file to the host
    async fn upload(&self, local: &Path, remote: &Path) -> Result<u64> {
        let op = Operation::Upload {
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
        };
        expect_transferred(&op, self.execute(op.clone()).await?)
    }

    /// Copy a file from the host to this machine
    async fn download(&self, remote: &Path, local: &Path) -> Result<u64> {
        let op = Operation::Download {
            remote: remote.to_path_buf(),
            local: local.to_path_buf(),
        };
        expect_transferred(&op, self.execute(op.clone()).await?)
    }
}

#[async_trait]
impl RemoteOps for Session {
    async fn execute(&self, operation: Operation) -> Result<OpOutput> {
        Session::execute(self, &operation).await
    }
}

fn expect_bool(op: &Operation, output: OpOutput) -> Result<bool> {
    match output {
        OpOutput::Bool(value) => Ok(value),
        other => Err(unexpected(op, "bool", &other)),
    }
}

fn expect_transferred(op: &Operation, output: OpOutput) -> Result<u64> {
    match output {
        OpOutput::Transferred(size) => Ok(size),
        other => Err(unexpected(op, "transferred", &other)),
    }
}

fn unexpected(op: &Operation, expected: &'static str, actual: &OpOutput) -> crate::HostlinkError {
    ProtocolError::UnexpectedOutput {
        operation: op.name(),
        expected,
        actual: actual.kind(),
    }
    .into()
}
