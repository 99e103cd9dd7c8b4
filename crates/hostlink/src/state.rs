//! Session connection state machine

use std::fmt;
use thiserror::Error;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Created, never connected
    Uninitialized,
    /// Connect or reconnect in progress
    Connecting,
    /// Transport established and authenticated
    Connected,
    /// Transport lost; a reconnect may follow
    Disconnected,
    /// Closed by the owner; terminal
    Closed,
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start connecting
    Connect,
    /// Connect succeeded
    Established,
    /// Connect failed or timed out
    Failed,
    /// Established transport reported a connection failure
    Lost,
    /// Owner closed the session
    Close,
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{event:?} is not valid in state {from}")]
pub struct InvalidTransition {
    /// State the event was applied to
    pub from: SessionStatus,
    /// Rejected event
    pub event: SessionEvent,
}

impl SessionStatus {
    /// Compute the state after `event`.
    ///
    /// `Close` is accepted everywhere, including on a closed session.
    /// `Lost` on an already disconnected session is a no-op so that
    /// concurrent failures on a stale transport collapse into one.
    pub fn transition(self, event: SessionEvent) -> Result<Self, InvalidTransition> {
        use SessionEvent::*;
        use SessionStatus::*;

        match (self, event) {
            (_, Close) => Ok(Closed),
            (Uninitialized | Disconnected, Connect) => Ok(Connecting),
            (Connecting, Established) => Ok(Connected),
            (Connecting, Failed) => Ok(Disconnected),
            (Connected | Disconnected, Lost) => Ok(Disconnected),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    /// Whether the transport is usable
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Whether the session was closed
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionStatus::*;

    #[test]
    fn test_happy_path() {
        let status = Uninitialized.transition(Connect).unwrap();
        assert_eq!(status, Connecting);
        let status = status.transition(Established).unwrap();
        assert!(status.is_connected());
    }

    #[test]
    fn test_reconnect_cycle() {
        let status = Connected.transition(Lost).unwrap();
        assert_eq!(status, Disconnected);
        let status = status.transition(Connect).unwrap();
        let status = status.transition(Failed).unwrap();
        assert_eq!(status, Disconnected);
        assert_eq!(status.transition(Lost).unwrap(), Disconnected);
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        for status in [Uninitialized, Connecting, Connected, Disconnected, Closed] {
            assert_eq!(status.transition(Close).unwrap(), Closed);
        }
        for event in [Connect, Established, Failed, Lost] {
            let err = Closed.transition(event).unwrap_err();
            assert_eq!(err.from, Closed);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(Connected.transition(Connect).is_err());
        assert!(Uninitialized.transition(Established).is_err());
        assert!(Uninitialized.transition(Lost).is_err());
        assert!(Disconnected.transition(Established).is_err());
    }
}
