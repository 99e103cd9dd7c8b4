//! SSH connection management

use crate::transport::{shell_command, shell_quote, Channel, ConnectionInfo, Credentials, TransportType};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use hostlink_proto::{DirEntry, FileMetadata, OpOutput, Operation, ProcessOutput, RemoteErrorKind};
use parking_lot::Mutex;
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Session, Sftp};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keepalive interval in seconds
const KEEPALIVE_INTERVAL: u32 = 15;

/// Underlying libssh2 handles
struct SshLink {
    session: Session,
    /// SFTP subsystem, opened on first use
    sftp: Option<Sftp>,
}

impl SshLink {
    fn sftp(&mut self) -> Result<&Sftp, TransportError> {
        if self.sftp.is_none() {
            let sftp = self
                .session
                .sftp()
                .map_err(|e| TransportError::Channel(format!("failed to open sftp subsystem: {}", e)))?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| TransportError::Channel("sftp subsystem unavailable".to_string()))
    }
}

/// An authenticated libssh2 session
pub struct SshConnection {
    link: Arc<Mutex<SshLink>>,
    connected: Arc<AtomicBool>,
    info: ConnectionInfo,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("info", &self.info)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SshConnection {
    /// Connect and authenticate. Blocking; run it off the async runtime.
    pub fn open(credentials: &Credentials) -> Result<Self, TransportError> {
        let host = credentials
            .host
            .clone()
            .ok_or_else(|| TransportError::Configuration("missing host address".to_string()))?;
        let username = credentials
            .username
            .clone()
            .ok_or_else(|| TransportError::Configuration("missing username".to_string()))?;

        let addr = (host.as_str(), credentials.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("failed to resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("no address for {}", host)))?;

        let tcp = TcpStream::connect_timeout(&addr, credentials.connect_timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                TransportError::Timeout
            } else {
                TransportError::Connection(format!("failed to connect to {}: {}", addr, e))
            }
        })?;

        let mut session = Session::new()
            .map_err(|e| TransportError::Connection(format!("failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(credentials.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(map_ssh_error)?;

        authenticate(&session, &username, credentials)?;

        // Operations may legitimately run longer than the handshake budget
        session.set_timeout(0);
        session.set_keepalive(true, KEEPALIVE_INTERVAL);

        debug!("SSH session established with {}", credentials.target());

        Ok(Self {
            link: Arc::new(Mutex::new(SshLink { session, sftp: None })),
            connected: Arc::new(AtomicBool::new(true)),
            info: ConnectionInfo {
                host,
                port: credentials.port,
                username,
                transport_type: TransportType::SshLibssh2,
            },
        })
    }
}

fn authenticate(session: &Session, username: &str, credentials: &Credentials) -> Result<(), TransportError> {
    if credentials.allow_agent {
        match session.userauth_agent(username) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("ssh-agent authentication failed: {}", e),
        }
    }

    if let Some(key) = credentials.identity_file.as_deref() {
        if !session.authenticated() {
            if let Err(e) = session.userauth_pubkey_file(username, None, key, None) {
                debug!("public key authentication with {} failed: {}", key.display(), e);
            }
        }
    }

    if let Some(password) = credentials.password.as_deref() {
        if !session.authenticated() {
            session
                .userauth_password(username, password)
                .map_err(|e| TransportError::Authentication(e.message().to_string()))?;
        }
    }

    if !session.authenticated() {
        return Err(TransportError::Authentication(format!(
            "no authentication method succeeded for {}",
            credentials.target()
        )));
    }
    Ok(())
}

#[async_trait]
impl Channel for SshConnection {
    async fn execute(&self, operation: &Operation) -> Result<OpOutput, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connection("connection is closed".to_string()));
        }

        let link = Arc::clone(&self.link);
        let operation = operation.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut link = link.lock();
            execute_blocking(&mut link, &operation)
        })
        .await
        .map_err(|e| TransportError::Channel(format!("operation task failed: {}", e)))?;

        if let Err(e) = &result {
            if e.is_transient() {
                warn!("SSH connection to {} lost: {}", self.info.host, e);
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing SSH connection to {}", self.info.host);
        let link = Arc::clone(&self.link);
        tokio::task::spawn_blocking(move || {
            let mut link = link.lock();
            link.sftp = None;
            if let Err(e) = link.session.disconnect(None, "closing", None) {
                debug!("SSH disconnect failed: {}", e);
            }
        })
        .await
        .map_err(|e| TransportError::Channel(format!("close task failed: {}", e)))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }
}

fn execute_blocking(link: &mut SshLink, operation: &Operation) -> Result<OpOutput, TransportError> {
    match operation {
        Operation::Run { command, env, cwd, stdin } => {
            let mut line = shell_command(command);
            if let Some(dir) = cwd {
                line = format!("cd {} && {}", shell_quote(&dir.to_string_lossy()), line);
            }

            let mut channel = link.session.channel_session().map_err(map_ssh_error)?;
            for (key, value) in env {
                // Servers commonly refuse setenv through AcceptEnv; not fatal
                let _ = channel.setenv(key, value);
            }
            channel.exec(&line).map_err(map_ssh_error)?;

            if let Some(input) = stdin {
                channel.write_all(input)?;
            }
            channel.send_eof().map_err(map_ssh_error)?;

            let mut stdout = Vec::new();
            channel.read_to_end(&mut stdout)?;
            let mut stderr = Vec::new();
            channel.stderr().read_to_end(&mut stderr)?;

            channel.wait_close().map_err(map_ssh_error)?;
            let exit_code = channel.exit_status().map_err(map_ssh_error)?;

            Ok(OpOutput::Process(ProcessOutput {
                exit_code,
                stdout: Bytes::from(stdout),
                stderr: Bytes::from(stderr),
            }))
        }
        Operation::Upload { local, remote } => {
            let mut source = std::fs::File::open(local)
                .map_err(|e| TransportError::from_local_io(e, local.display()))?;
            let sftp = link.sftp()?;
            let mut target = sftp.create(remote).map_err(map_ssh_error)?;
            let copied = io::copy(&mut source, &mut target)?;
            Ok(OpOutput::Transferred(copied))
        }
        Operation::Download { remote, local } => {
            let sftp = link.sftp()?;
            let mut source = sftp.open(remote).map_err(map_ssh_error)?;
            let mut target = std::fs::File::create(local)
                .map_err(|e| TransportError::from_local_io(e, local.display()))?;
            let copied = io::copy(&mut source, &mut target)?;
            Ok(OpOutput::Transferred(copied))
        }
        other => execute_sftp(link.sftp()?, other),
    }
}

fn execute_sftp(sftp: &Sftp, operation: &Operation) -> Result<OpOutput, TransportError> {
    match operation {
        Operation::Exists { path } => Ok(OpOutput::Bool(probe(sftp.stat(path))?.is_some())),
        Operation::IsFile { path } => Ok(OpOutput::Bool(
            probe(sftp.stat(path))?.map_or(false, |stat| stat.is_file()),
        )),
        Operation::IsDir { path } => Ok(OpOutput::Bool(
            probe(sftp.stat(path))?.map_or(false, |stat| stat.is_dir()),
        )),
        Operation::IsSymlink { path } => Ok(OpOutput::Bool(
            probe(sftp.lstat(path))?.map_or(false, |stat| stat.file_type().is_symlink()),
        )),
        Operation::Stat { path, follow_symlinks } => {
            let stat = if *follow_symlinks {
                sftp.stat(path)
            } else {
                sftp.lstat(path)
            }
            .map_err(map_ssh_error)?;
            Ok(OpOutput::Metadata(to_metadata(&stat)))
        }
        Operation::ListDir { path } => {
            let entries = sftp
                .readdir(path)
                .map_err(map_ssh_error)?
                .into_iter()
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().into_owned();
                    Some(DirEntry {
                        name,
                        metadata: to_metadata(&stat),
                        path,
                    })
                })
                .collect();
            Ok(OpOutput::Entries(entries))
        }
        Operation::ReadFile { path } => {
            let mut file = sftp.open(path).map_err(map_ssh_error)?;
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            Ok(OpOutput::Content(Bytes::from(content)))
        }
        Operation::WriteFile { path, content, append } => {
            let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
            flags |= if *append { OpenFlags::APPEND } else { OpenFlags::TRUNCATE };
            let mut file = sftp
                .open_mode(path, flags, 0o644, OpenType::File)
                .map_err(map_ssh_error)?;
            file.write_all(content)?;
            Ok(OpOutput::Transferred(content.len() as u64))
        }
        Operation::CreateDir { path, mode, parents } => {
            if *parents {
                create_dir_all(sftp, path, *mode)?;
            } else {
                sftp.mkdir(path, *mode as i32).map_err(map_ssh_error)?;
            }
            Ok(OpOutput::Unit)
        }
        Operation::RemoveFile { path } => {
            sftp.unlink(path).map_err(map_ssh_error)?;
            Ok(OpOutput::Unit)
        }
        Operation::RemoveDir { path } => {
            sftp.rmdir(path).map_err(map_ssh_error)?;
            Ok(OpOutput::Unit)
        }
        Operation::RemoveDirAll { path } => {
            remove_dir_all(sftp, path)?;
            Ok(OpOutput::Unit)
        }
        Operation::Rename { from, to } => {
            sftp.rename(from, to, None).map_err(map_ssh_error)?;
            Ok(OpOutput::Unit)
        }
        Operation::Canonicalize { path } => Ok(OpOutput::Path(sftp.realpath(path).map_err(map_ssh_error)?)),
        Operation::SetPermissions { path, mode } => {
            let stat = FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(*mode),
                atime: None,
                mtime: None,
            };
            sftp.setstat(path, stat).map_err(map_ssh_error)?;
            Ok(OpOutput::Unit)
        }
        Operation::Run { .. } | Operation::Upload { .. } | Operation::Download { .. } => Err(
            TransportError::Unsupported(format!("{} is not an sftp operation", operation.name())),
        ),
    }
}

/// Turn "no such file" into `None`, keep every other failure
fn probe(result: Result<FileStat, ssh2::Error>) -> Result<Option<FileStat>, TransportError> {
    match result {
        Ok(stat) => Ok(Some(stat)),
        Err(e) => match map_ssh_error(e) {
            TransportError::Remote {
                kind: RemoteErrorKind::NotFound,
                ..
            } => Ok(None),
            other => Err(other),
        },
    }
}

fn create_dir_all(sftp: &Sftp, path: &Path, mode: u32) -> Result<(), TransportError> {
    let mut current = PathBuf::new();
    for part in path.components() {
        current.push(part);
        match probe(sftp.stat(&current))? {
            Some(stat) if stat.is_dir() => continue,
            Some(_) => {
                return Err(TransportError::remote(
                    RemoteErrorKind::NotADirectory,
                    current.display().to_string(),
                ))
            }
            None => sftp.mkdir(&current, mode as i32).map_err(map_ssh_error)?,
        }
    }
    Ok(())
}

fn remove_dir_all(sftp: &Sftp, path: &Path) -> Result<(), TransportError> {
    for (child, stat) in sftp.readdir(path).map_err(map_ssh_error)? {
        if stat.is_dir() && !stat.file_type().is_symlink() {
            remove_dir_all(sftp, &child)?;
        } else {
            sftp.unlink(&child).map_err(map_ssh_error)?;
        }
    }
    sftp.rmdir(path).map_err(map_ssh_error)
}

fn to_metadata(stat: &FileStat) -> FileMetadata {
    FileMetadata {
        size: stat.size.unwrap_or(0),
        mode: stat.perm.unwrap_or(0) & 0o7777,
        modified: stat.mtime.unwrap_or(0),
        is_dir: stat.is_dir(),
        is_symlink: stat.file_type().is_symlink(),
    }
}

// libssh2 session error codes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

// SFTP status codes
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;
const SFTP_NO_CONNECTION: i32 = 6;
const SFTP_CONNECTION_LOST: i32 = 7;
const SFTP_NO_SUCH_PATH: i32 = 10;
const SFTP_FILE_ALREADY_EXISTS: i32 = 11;
const SFTP_DIR_NOT_EMPTY: i32 = 18;
const SFTP_NOT_A_DIRECTORY: i32 = 19;
const SFTP_FILE_IS_A_DIRECTORY: i32 = 24;

/// Classify a libssh2 error as a connection failure or an operation failure
pub(crate) fn map_ssh_error(err: ssh2::Error) -> TransportError {
    let message = err.message().to_string();
    match err.code() {
        ErrorCode::SFTP(code) => {
            let kind = match code {
                SFTP_NO_SUCH_FILE | SFTP_NO_SUCH_PATH => RemoteErrorKind::NotFound,
                SFTP_PERMISSION_DENIED => RemoteErrorKind::PermissionDenied,
                SFTP_FILE_ALREADY_EXISTS => RemoteErrorKind::AlreadyExists,
                SFTP_DIR_NOT_EMPTY => RemoteErrorKind::DirectoryNotEmpty,
                SFTP_NOT_A_DIRECTORY => RemoteErrorKind::NotADirectory,
                SFTP_FILE_IS_A_DIRECTORY => RemoteErrorKind::IsADirectory,
                SFTP_NO_CONNECTION | SFTP_CONNECTION_LOST => {
                    return TransportError::Connection(message)
                }
                _ => RemoteErrorKind::Other,
            };
            TransportError::remote(kind, message)
        }
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => TransportError::Timeout,
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => {
            TransportError::Authentication(message)
        }
        ErrorCode::Session(_) => TransportError::Connection(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sftp_error(code: i32) -> ssh2::Error {
        ssh2::Error::new(ErrorCode::SFTP(code), "sftp failure")
    }

    #[test]
    fn test_map_sftp_errors() {
        let err = map_ssh_error(sftp_error(SFTP_NO_SUCH_FILE));
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::NotFound));
        assert!(!err.is_transient());

        let err = map_ssh_error(sftp_error(SFTP_PERMISSION_DENIED));
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::PermissionDenied));

        let err = map_ssh_error(sftp_error(4));
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Other));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_map_connection_errors() {
        assert!(map_ssh_error(sftp_error(SFTP_CONNECTION_LOST)).is_transient());
        assert!(matches!(
            map_ssh_error(ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "timeout")),
            TransportError::Timeout
        ));
        assert!(matches!(
            map_ssh_error(ssh2::Error::new(ErrorCode::Session(-7), "socket send")),
            TransportError::Connection(_)
        ));
        assert!(matches!(
            map_ssh_error(ssh2::Error::new(
                ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
                "denied"
            )),
            TransportError::Authentication(_)
        ));
    }

    #[test]
    fn test_open_refuses_unreachable_host() {
        let creds = Credentials::remote("nobody", "127.0.0.1")
            .with_port(1)
            .with_agent(true)
            .with_connect_timeout(std::time::Duration::from_millis(500));
        let err = SshConnection::open(&creds).unwrap_err();
        assert!(err.is_transient());
    }
}
