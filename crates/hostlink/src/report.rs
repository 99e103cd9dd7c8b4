//! Progress and reconnect notices
//!
//! Reporters are fire-and-forget: `report` is synchronous and must return
//! immediately, so a slow or absent consumer never stalls an operation.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A notice emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    /// Transport established
    Connected {
        /// Session key
        key: String,
        /// `user@host:port` or `local`
        target: String,
    },
    /// Transport lost, reconnect about to be attempted
    Reconnecting {
        /// Session key
        key: String,
        /// Attempt number (1-based)
        attempt: u32,
        /// Attempt budget
        max_attempts: u32,
        /// Failure that triggered the reconnect
        reason: String,
    },
    /// Reconnect budget exhausted
    GaveUp {
        /// Session key
        key: String,
        /// Attempts made
        attempts: u32,
    },
    /// Session closed
    Closed {
        /// Session key
        key: String,
    },
}

impl ReportEvent {
    /// Key of the session the event belongs to
    pub fn key(&self) -> &str {
        match self {
            Self::Connected { key, .. }
            | Self::Reconnecting { key, .. }
            | Self::GaveUp { key, .. }
            | Self::Closed { key } => key,
        }
    }
}

impl fmt::Display for ReportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { key, target } => write!(f, "{}: connected to {}", key, target),
            Self::Reconnecting {
                key,
                attempt,
                max_attempts,
                reason,
            } => write!(
                f,
                "{}: connection lost ({}), reconnecting {}/{}",
                key, reason, attempt, max_attempts
            ),
            Self::GaveUp { key, attempts } => {
                write!(f, "{}: giving up after {} reconnect attempts", key, attempts)
            }
            Self::Closed { key } => write!(f, "{}: closed", key),
        }
    }
}

/// Sink for [`ReportEvent`]s
pub trait Reporter: Send + Sync {
    /// Deliver an event; must not block
    fn report(&self, event: &ReportEvent);
}

/// Writes events to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &ReportEvent) {
        match event {
            ReportEvent::Reconnecting { .. } | ReportEvent::GaveUp { .. } => warn!("{}", event),
            ReportEvent::Connected { .. } | ReportEvent::Closed { .. } => info!("{}", event),
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _event: &ReportEvent) {}
}

/// Forwards events to a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<ReportEvent>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ReportEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, event: &ReportEvent) {
        // Full or closed receiver: the notice is dropped
        let _ = self.tx.try_send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let event = ReportEvent::Reconnecting {
            key: "h1".into(),
            attempt: 2,
            max_attempts: 3,
            reason: "Operation timed out".into(),
        };
        assert_eq!(
            event.to_string(),
            "h1: connection lost (Operation timed out), reconnecting 2/3"
        );
        assert_eq!(event.key(), "h1");
    }

    #[tokio::test]
    async fn test_channel_reporter_drops_when_full() {
        let (reporter, mut rx) = ChannelReporter::new(1);
        reporter.report(&ReportEvent::Closed { key: "a".into() });
        reporter.report(&ReportEvent::Closed { key: "b".into() });

        assert_eq!(rx.recv().await, Some(ReportEvent::Closed { key: "a".into() }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_reporter_closed_receiver() {
        let (reporter, rx) = ChannelReporter::new(4);
        drop(rx);
        reporter.report(&ReportEvent::Closed { key: "a".into() });
    }
}
