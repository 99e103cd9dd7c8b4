//! Per-key session pool with round-robin rotation

use crate::{HostlinkError, Result, Session};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, warn};

struct PoolState {
    sessions: VecDeque<Session>,
    /// Index of the session the next `get` returns
    cursor: usize,
}

/// Ordered multiset of sessions registered under one key.
///
/// The buffer and the rotation cursor share one mutex, so concurrent `get`
/// calls never hand out the same session twice within one rotation.
pub struct SessionPool {
    key: String,
    state: Mutex<PoolState>,
}

impl SessionPool {
    /// Create an empty pool
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(PoolState {
                sessions: VecDeque::new(),
                cursor: 0,
            }),
        }
    }

    /// Create a pool holding `sessions` in order
    pub fn with_sessions(key: impl Into<String>, sessions: impl IntoIterator<Item = Session>) -> Self {
        let pool = Self::new(key);
        pool.state.lock().sessions.extend(sessions);
        pool
    }

    /// Pool key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether the pool has no sessions
    pub fn is_empty(&self) -> bool {
        self.state.lock().sessions.is_empty()
    }

    /// Append a session; duplicates are allowed
    pub fn add(&self, session: Session) {
        self.state.lock().sessions.push_back(session);
    }

    /// Session at the cursor, advancing the cursor
    pub fn get(&self) -> Result<Session> {
        let mut state = self.state.lock();
        let len = state.sessions.len();
        if len == 0 {
            return Err(self.empty());
        }
        let index = state.cursor % len;
        state.cursor = (index + 1) % len;
        Ok(state.sessions[index].clone())
    }

    /// All sessions in insertion order, without rotating
    pub fn get_all(&self) -> Vec<Session> {
        self.state.lock().sessions.iter().cloned().collect()
    }

    /// Remove the least recently added session without closing it.
    ///
    /// Returns the session and whether the pool is now empty.
    pub fn take_one(&self) -> Result<(Session, bool)> {
        let mut state = self.state.lock();
        let session = state.sessions.pop_front().ok_or_else(|| self.empty())?;
        // Keep pointing at the same successor
        state.cursor = state.cursor.saturating_sub(1);
        let len = state.sessions.len();
        if len > 0 {
            state.cursor %= len;
        } else {
            state.cursor = 0;
        }
        Ok((session, len == 0))
    }

    /// Remove and close the least recently added session.
    ///
    /// Returns the session and whether the pool is now empty.
    pub async fn remove_one(&self) -> Result<(Session, bool)> {
        let (session, emptied) = self.take_one()?;
        debug!("Removing session {} from pool {}", session.id(), self.key);
        if let Err(e) = session.close().await {
            warn!("Failed to close session in pool {}: {}", self.key, e);
        }
        Ok((session, emptied))
    }

    /// Remove every session without closing them
    pub fn take_all(&self) -> Vec<Session> {
        let mut state = self.state.lock();
        state.cursor = 0;
        state.sessions.drain(..).collect()
    }

    /// Close and discard every session
    pub async fn remove_all(&self) {
        for session in self.take_all() {
            if let Err(e) = session.close().await {
                warn!("Failed to close session in pool {}: {}", self.key, e);
            }
        }
    }

    /// Close every session, keeping them in the pool
    pub async fn close_all(&self) {
        for session in self.get_all() {
            if let Err(e) = session.close().await {
                warn!("Failed to close session in pool {}: {}", self.key, e);
            }
        }
    }

    /// Independent pool over the same sessions, with the same cursor
    pub fn shallow_copy(&self) -> Self {
        let state = self.state.lock();
        Self {
            key: self.key.clone(),
            state: Mutex::new(PoolState {
                sessions: state.sessions.clone(),
                cursor: state.cursor,
            }),
        }
    }

    fn empty(&self) -> HostlinkError {
        HostlinkError::EmptyPool { key: self.key.clone() }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionPool")
            .field("key", &self.key)
            .field("len", &state.sessions.len())
            .field("cursor", &state.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_ssh::{Credentials, MockTransport};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn sessions(n: usize) -> Vec<Session> {
        let transport = Arc::new(MockTransport::new());
        (0..n)
            .map(|_| {
                Session::builder("h", Credentials::remote("u", "h").with_agent(true), transport.clone()).build()
            })
            .collect()
    }

    #[test]
    fn test_rotation_order() {
        let s = sessions(2);
        let pool = SessionPool::with_sessions("h", s.clone());

        assert_eq!(pool.get().unwrap(), s[0]);
        assert_eq!(pool.get().unwrap(), s[1]);
        assert_eq!(pool.get().unwrap(), s[0]);
    }

    #[test]
    fn test_empty_pool() {
        let pool = SessionPool::new("h");
        assert!(matches!(pool.get(), Err(HostlinkError::EmptyPool { .. })));
        assert!(matches!(pool.take_one(), Err(HostlinkError::EmptyPool { .. })));
    }

    #[test]
    fn test_take_one_is_fifo() {
        let s = sessions(3);
        let pool = SessionPool::with_sessions("h", s.clone());

        let (first, emptied) = pool.take_one().unwrap();
        assert_eq!(first, s[0]);
        assert!(!emptied);
        assert_eq!(pool.get_all(), vec![s[1].clone(), s[2].clone()]);
    }

    #[test]
    fn test_cursor_survives_front_removal() {
        let s = sessions(3);
        let pool = SessionPool::with_sessions("h", s.clone());

        assert_eq!(pool.get().unwrap(), s[0]);
        assert_eq!(pool.get().unwrap(), s[1]);
        pool.take_one().unwrap();
        // s[2] was next before the removal and still is
        assert_eq!(pool.get().unwrap(), s[2]);
        assert_eq!(pool.get().unwrap(), s[1]);
    }

    #[tokio::test]
    async fn test_remove_one_closes() {
        let s = sessions(1);
        let pool = SessionPool::with_sessions("h", s.clone());

        let (removed, emptied) = pool.remove_one().await.unwrap();
        assert!(emptied);
        assert!(removed.status().is_closed());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_remove_all_closes_everything() {
        let s = sessions(3);
        let pool = SessionPool::with_sessions("h", s.clone());

        pool.remove_all().await;
        assert!(pool.is_empty());
        assert!(s.iter().all(|session| session.status().is_closed()));
    }

    #[test]
    fn test_concurrent_get_is_fair() {
        let s = sessions(4);
        let pool = Arc::new(SessionPool::with_sessions("h", s.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || (0..100).map(|_| pool.get().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut counts = vec![0usize; 4];
        for handle in handles {
            for session in handle.join().unwrap() {
                let index = s.iter().position(|x| *x == session).unwrap();
                counts[index] += 1;
            }
        }
        assert_eq!(counts, vec![100; 4]);
    }

    proptest! {
        #[test]
        fn prop_rotation_visits_each_once(n in 1usize..8, rounds in 1usize..4) {
            let s = sessions(n);
            let pool = SessionPool::with_sessions("h", s.clone());

            for _ in 0..rounds {
                let visited: Vec<Session> = (0..n).map(|_| pool.get().unwrap()).collect();
                prop_assert_eq!(&visited, &s);
            }
        }
    }
}
