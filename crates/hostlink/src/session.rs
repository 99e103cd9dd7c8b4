//! Sessions and resilient operation execution
//!
//! A [`Session`] is one logical connection to a host. Its transport is opened
//! lazily on first use. Every operation goes through [`Session::execute`],
//! which absorbs connection failures by reconnecting with the stored
//! credentials and re-issuing the operation, up to the budget of the
//! session's [`RetryPolicy`]. Failures of the operation itself are returned
//! unchanged and never retried.

use crate::report::{ReportEvent, Reporter, TracingReporter};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{SessionEvent, SessionStatus};
use crate::{HostlinkError, Result};
use hostlink_proto::{ConnectionKind, OpOutput, Operation, SessionRecord};
use hostlink_ssh::{Channel, ConnectionInfo, Credentials, Transport, TransportError};

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-session settings used when opening a session through a factory
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Open a local session instead of resolving the key as a remote host
    pub local: bool,
    /// Serialize operations on the session; falls back to the factory default
    pub thread_safe: Option<bool>,
    /// Explicit credentials, bypassing host-alias lookup
    pub credentials: Option<Credentials>,
}

impl SessionOptions {
    /// Local session options
    pub fn local() -> Self {
        Self {
            local: true,
            ..Self::default()
        }
    }

    /// Set the thread-safety flag
    pub fn with_thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = Some(thread_safe);
        self
    }

    /// Use explicit credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    key: String,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    reporter: Arc<dyn Reporter>,
    thread_safe: bool,
}

impl SessionBuilder {
    /// Set the reconnect policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the reporting sink
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Serialize operations on this session
    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    /// Build a disconnected session
    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                key: self.key,
                credentials: self.credentials,
                transport: self.transport,
                policy: self.policy,
                reporter: self.reporter,
                thread_safe: self.thread_safe,
                created_at: SystemTime::now(),
                link: Mutex::new(Link {
                    status: SessionStatus::Uninitialized,
                    channel: None,
                }),
                op_lock: tokio::sync::Mutex::new(()),
                reconnect_lock: tokio::sync::Mutex::new(()),
                reconnects: AtomicU32::new(0),
            }),
        }
    }
}

/// Live transport state; only ever locked for the mutation itself
struct Link {
    status: SessionStatus,
    channel: Option<Arc<dyn Channel>>,
}

struct SessionInner {
    id: Uuid,
    key: String,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    reporter: Arc<dyn Reporter>,
    thread_safe: bool,
    created_at: SystemTime,
    link: Mutex<Link>,
    /// Held for a whole operation when `thread_safe` is set
    op_lock: tokio::sync::Mutex<()>,
    /// Keeps connect attempts for this session strictly sequential
    reconnect_lock: tokio::sync::Mutex<()>,
    reconnects: AtomicU32,
}

/// Handle to one logical connection.
///
/// Cloning the handle shares the session; the transport is dropped together
/// with the last handle.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start building a session
    pub fn builder(key: impl Into<String>, credentials: Credentials, transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            key: key.into(),
            credentials,
            transport,
            policy: RetryPolicy::default(),
            reporter: Arc::new(TracingReporter),
            thread_safe: false,
        }
    }

    /// Unique session id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Key (host alias) the session belongs to
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Remote or local
    pub fn kind(&self) -> ConnectionKind {
        self.inner.credentials.kind
    }

    /// Credentials used to (re)connect
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// Reconnect policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Whether operations on this session are serialized
    pub fn is_thread_safe(&self) -> bool {
        self.inner.thread_safe
    }

    /// Creation time
    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    /// Current connection state
    pub fn status(&self) -> SessionStatus {
        self.inner.link.lock().status
    }

    /// Whether a transport is currently established
    pub fn is_connected(&self) -> bool {
        let link = self.inner.link.lock();
        link.status.is_connected() && link.channel.as_ref().map_or(false, |c| c.is_connected())
    }

    /// Number of reconnect attempts made over the session's lifetime
    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Information about the established transport
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.link.lock().channel.as_ref().map(|c| c.connection_info())
    }

    /// Whether two handles refer to the same session
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Persisted form of this session; never includes a password
    pub fn to_record(&self) -> SessionRecord {
        let credentials = &self.inner.credentials;
        SessionRecord {
            key: self.inner.key.clone(),
            connection_kind: credentials.kind,
            username: credentials.username.clone(),
            host: credentials.host.clone(),
            port: credentials.port,
            identity_file: credentials.identity_file.clone(),
            allow_agent: credentials.allow_agent,
            thread_safe: self.inner.thread_safe,
        }
    }

    /// Connect eagerly, with the same retry budget as an operation
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.operation_guard().await;
        self.with_reconnect(|_| async { Ok(()) }).await
    }

    /// Execute one operation, reconnecting on connection failures.
    ///
    /// Operations that are not idempotent (appends, process runs, renames)
    /// are executed at least once: a failure after the host applied the
    /// operation but before the answer arrived leads to a second execution.
    pub async fn execute(&self, operation: &Operation) -> Result<OpOutput> {
        let _guard = self.operation_guard().await;
        debug!("{}: {}", self.inner.key, operation);
        self.with_reconnect(|channel| async move { channel.execute(operation).await })
            .await
    }

    /// Close the session. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let channel = {
            let mut link = self.inner.link.lock();
            if link.status.is_closed() {
                return Ok(());
            }
            link.status = link.status.transition(SessionEvent::Close)?;
            link.channel.take()
        };

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close connection for {}: {}", self.inner.key, e);
            }
        }

        info!("Session {} closed", self.inner.key);
        self.inner.reporter.report(&ReportEvent::Closed {
            key: self.inner.key.clone(),
        });
        Ok(())
    }

    async fn operation_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.inner.thread_safe {
            Some(self.inner.op_lock.lock().await)
        } else {
            None
        }
    }

    /// Run `call` on a live channel, reconnecting while the policy allows
    async fn with_reconnect<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Channel>) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let mut attempts = 0;
        loop {
            let error = match self.establish().await {
                Ok(channel) => match call(Arc::clone(&channel)).await {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        if e.is_transient() {
                            self.mark_lost(&channel);
                        }
                        e
                    }
                },
                Err(HostlinkError::Transport(e)) => e,
                Err(e) => return Err(e),
            };

            match self.inner.policy.decide(attempts, &error) {
                RetryDecision::Propagate => return Err(HostlinkError::from(error)),
                RetryDecision::GiveUp => {
                    self.inner.reporter.report(&ReportEvent::GaveUp {
                        key: self.inner.key.clone(),
                        attempts,
                    });
                    return Err(HostlinkError::FatalConnection {
                        key: self.inner.key.clone(),
                        attempts,
                    });
                }
                RetryDecision::Retry { delay } => {
                    attempts += 1;
                    self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "{}: reconnect attempt {}/{} in {:?} after: {}",
                        self.inner.key, attempts, self.inner.policy.max_attempts, delay, error
                    );
                    self.inner.reporter.report(&ReportEvent::Reconnecting {
                        key: self.inner.key.clone(),
                        attempt: attempts,
                        max_attempts: self.inner.policy.max_attempts,
                        reason: error.to_string(),
                    });
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Established channel, if it is still usable
    fn live_channel(&self) -> Result<Option<Arc<dyn Channel>>> {
        let mut link = self.inner.link.lock();
        match link.status {
            SessionStatus::Closed => Err(self.closed()),
            SessionStatus::Connected => match &link.channel {
                Some(channel) if channel.is_connected() => Ok(Some(Arc::clone(channel))),
                _ => {
                    link.status = link.status.transition(SessionEvent::Lost)?;
                    link.channel = None;
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    /// Return the live channel or open a new one.
    ///
    /// A failed or timed out connect comes back as `HostlinkError::Transport`
    /// so the caller can feed it into the retry decision.
    async fn establish(&self) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.live_channel()? {
            return Ok(channel);
        }

        let _reconnect = self.inner.reconnect_lock.lock().await;
        // Another task may have connected while we waited
        if let Some(channel) = self.live_channel()? {
            return Ok(channel);
        }
        self.apply(SessionEvent::Connect)?;
        let pending = PendingConnect::new(&self.inner.link);

        let connect = self.inner.transport.connect(&self.inner.credentials);
        let result = match tokio::time::timeout(self.inner.policy.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        pending.settle();

        match result {
            Ok(channel) => {
                let accepted = {
                    let mut link = self.inner.link.lock();
                    match link.status.transition(SessionEvent::Established) {
                        Ok(status) => {
                            link.status = status;
                            link.channel = Some(Arc::clone(&channel));
                            true
                        }
                        Err(_) => false,
                    }
                };

                if !accepted {
                    // Closed while connecting
                    let _ = channel.close().await;
                    return Err(self.closed());
                }

                let target = self.inner.credentials.target();
                info!("Session {} connected to {}", self.inner.key, target);
                self.inner.reporter.report(&ReportEvent::Connected {
                    key: self.inner.key.clone(),
                    target,
                });
                Ok(channel)
            }
            Err(e) => {
                self.apply(SessionEvent::Failed)?;
                Err(HostlinkError::Transport(e))
            }
        }
    }

    /// Drop `failed` if it is still the session's channel
    fn mark_lost(&self, failed: &Arc<dyn Channel>) {
        let mut link = self.inner.link.lock();
        let current = link.channel.as_ref().map_or(false, |c| Arc::ptr_eq(c, failed));
        if current {
            link.channel = None;
            if let Ok(status) = link.status.transition(SessionEvent::Lost) {
                link.status = status;
            }
        }
    }

    fn apply(&self, event: SessionEvent) -> Result<()> {
        let mut link = self.inner.link.lock();
        if link.status.is_closed() {
            return Err(self.closed());
        }
        link.status = link.status.transition(event)?;
        Ok(())
    }

    fn closed(&self) -> HostlinkError {
        HostlinkError::SessionClosed {
            key: self.inner.key.clone(),
        }
    }
}

/// Rolls `Connecting` back to `Disconnected` when a connect is abandoned
/// because the future driving it was dropped.
struct PendingConnect<'a> {
    link: &'a Mutex<Link>,
    armed: bool,
}

impl<'a> PendingConnect<'a> {
    fn new(link: &'a Mutex<Link>) -> Self {
        Self { link, armed: true }
    }

    /// The connect finished; the caller records its outcome
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut link = self.link.lock();
        if link.status == SessionStatus::Connecting {
            if let Ok(status) = link.status.transition(SessionEvent::Failed) {
                link.status = status;
            }
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("target", &self.inner.credentials.target())
            .field("status", &self.status())
            .field("thread_safe", &self.inner.thread_safe)
            .finish()
    }
}
