//! Operation and result types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// A single file, path or process operation addressed to one host.
///
/// Every operation a session can perform is one of these variants; the
/// transport layer executes them one-to-one and answers with an
/// [`OpOutput`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Test whether a path exists
    Exists {
        /// Target path
        path: PathBuf,
    },

    /// Test whether a path is a regular file
    IsFile {
        /// Target path
        path: PathBuf,
    },

    /// Test whether a path is a directory
    IsDir {
        /// Target path
        path: PathBuf,
    },

    /// Test whether a path is a symbolic link
    IsSymlink {
        /// Target path
        path: PathBuf,
    },

    /// Fetch metadata for a path
    Stat {
        /// Target path
        path: PathBuf,
        /// Follow symbolic links
        follow_symlinks: bool,
    },

    /// List a directory
    ListDir {
        /// Directory path
        path: PathBuf,
    },

    /// Read a whole file
    ReadFile {
        /// Path to file
        path: PathBuf,
    },

    /// Write (or append to) a file
    WriteFile {
        /// Path to file
        path: PathBuf,
        /// File content
        content: Bytes,
        /// Append instead of truncating
        append: bool,
    },

    /// Create a directory
    CreateDir {
        /// Directory path
        path: PathBuf,
        /// Permission bits
        mode: u32,
        /// Create missing parents, succeed if it already exists
        parents: bool,
    },

    /// Remove a file or symlink
    RemoveFile {
        /// Path to file
        path: PathBuf,
    },

    /// Remove an empty directory
    RemoveDir {
        /// Directory path
        path: PathBuf,
    },

    /// Remove a directory and everything under it
    RemoveDirAll {
        /// Directory path
        path: PathBuf,
    },

    /// Rename or move a path
    Rename {
        /// Source path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
    },

    /// Resolve a path to its canonical absolute form
    Canonicalize {
        /// Target path
        path: PathBuf,
    },

    /// Change permission bits
    SetPermissions {
        /// Target path
        path: PathBuf,
        /// Permission bits
        mode: u32,
    },

    /// Run a command through the host's shell
    Run {
        /// Command and arguments
        command: Vec<String>,
        /// Environment variables
        env: HashMap<String, String>,
        /// Working directory
        cwd: Option<PathBuf>,
        /// Standard input data
        stdin: Option<Bytes>,
    },

    /// Copy a file from this machine to the host
    Upload {
        /// Path on this machine
        local: PathBuf,
        /// Path on the host
        remote: PathBuf,
    },

    /// Copy a file from the host to this machine
    Download {
        /// Path on the host
        remote: PathBuf,
        /// Path on this machine
        local: PathBuf,
    },
}

impl Operation {
    /// Short operation name used in logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exists { .. } => "exists",
            Self::IsFile { .. } => "is_file",
            Self::IsDir { .. } => "is_dir",
            Self::IsSymlink { .. } => "is_symlink",
            Self::Stat { .. } => "stat",
            Self::ListDir { .. } => "list_dir",
            Self::ReadFile { .. } => "read",
            Self::WriteFile { append: false, .. } => "write",
            Self::WriteFile { append: true, .. } => "append",
            Self::CreateDir { .. } => "create_dir",
            Self::RemoveFile { .. } => "remove_file",
            Self::RemoveDir { .. } => "remove_dir",
            Self::RemoveDirAll { .. } => "remove_dir_all",
            Self::Rename { .. } => "rename",
            Self::Canonicalize { .. } => "canonicalize",
            Self::SetPermissions { .. } => "set_permissions",
            Self::Run { .. } => "run",
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
        }
    }

    /// Whether executing this operation twice has the same effect as once.
    ///
    /// Retried operations that are not idempotent may run more than once.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Self::WriteFile { append: true, .. } | Self::Run { .. } | Self::Rename { .. }
        )
    }

    /// Create a run request with no environment, working directory or stdin
    pub fn run<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Run {
            command: command.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
            stdin: None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rename { from, to } => write!(f, "rename {} -> {}", from.display(), to.display()),
            Self::Upload { local, remote } => {
                write!(f, "upload {} -> {}", local.display(), remote.display())
            }
            Self::Download { remote, local } => {
                write!(f, "download {} -> {}", remote.display(), local.display())
            }
            Self::Run { command, .. } => write!(f, "run {}", command.join(" ")),
            Self::Exists { path }
            | Self::IsFile { path }
            | Self::IsDir { path }
            | Self::IsSymlink { path }
            | Self::Stat { path, .. }
            | Self::ListDir { path }
            | Self::ReadFile { path }
            | Self::WriteFile { path, .. }
            | Self::CreateDir { path, .. }
            | Self::RemoveFile { path }
            | Self::RemoveDir { path }
            | Self::RemoveDirAll { path }
            | Self::Canonicalize { path }
            | Self::SetPermissions { path, .. } => write!(f, "{} {}", self.name(), path.display()),
        }
    }
}

/// Result of an [`Operation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOutput {
    /// Operation completed with nothing to report
    Unit,
    /// Boolean answer (exists, is_file, ...)
    Bool(bool),
    /// File content
    Content(Bytes),
    /// Number of bytes transferred
    Transferred(u64),
    /// A resolved path
    Path(PathBuf),
    /// Path metadata
    Metadata(FileMetadata),
    /// Directory listing
    Entries(Vec<DirEntry>),
    /// Finished process
    Process(ProcessOutput),
}

impl OpOutput {
    /// Variant name, used in unexpected-output errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Content(_) => "content",
            Self::Transferred(_) => "transferred",
            Self::Path(_) => "path",
            Self::Metadata(_) => "metadata",
            Self::Entries(_) => "entries",
            Self::Process(_) => "process",
        }
    }
}

/// File metadata information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,
    /// File permissions mode
    pub mode: u32,
    /// Last modified timestamp (Unix epoch)
    pub modified: u64,
    /// Whether this is a directory
    pub is_dir: bool,
    /// Whether this is a symlink
    pub is_symlink: bool,
}

impl FileMetadata {
    /// Whether this is a regular file
    pub fn is_file(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }
}

/// Directory entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// File metadata
    pub metadata: FileMetadata,
}

/// Process execution output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code of the process
    pub exit_code: i32,
    /// Standard output
    pub stdout: Bytes,
    /// Standard error
    pub stderr: Bytes,
}

impl ProcessOutput {
    /// Check if the process succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Classification of a failed operation on the host side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Path does not exist
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Path already exists
    AlreadyExists,
    /// Expected a directory
    NotADirectory,
    /// Expected a file
    IsADirectory,
    /// Directory is not empty
    DirectoryNotEmpty,
    /// Any other failure reported by the host
    Other,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::AlreadyExists => "already exists",
            Self::NotADirectory => "not a directory",
            Self::IsADirectory => "is a directory",
            Self::DirectoryNotEmpty => "directory not empty",
            Self::Other => "remote failure",
        };
        f.write_str(text)
    }
}
