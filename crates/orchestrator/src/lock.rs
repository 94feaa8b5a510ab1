//! Per-session mutual exclusion with acquire-or-skip semantics.
//!
//! The status poller and the lifecycle controller must not touch the same
//! session concurrently. Callers try to acquire and simply skip the session
//! this cycle when the lock is held; the next periodic invocation retries.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::session::SessionId;

/// Set of currently-locked session ids
#[derive(Default)]
pub struct SessionLocks {
    held: Mutex<HashSet<SessionId>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to lock a session. Returns None when the lock is already held.
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionGuard<'_>> {
        let mut held = self.held.lock().unwrap();
        if held.insert(session_id.to_string()) {
            Some(SessionGuard {
                locks: self,
                session_id: session_id.to_string(),
            })
        } else {
            None
        }
    }
}

/// Releases the session lock on drop
pub struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    session_id: SessionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_skips() {
        let locks = SessionLocks::new();
        let guard = locks.try_acquire("s1");
        assert!(guard.is_some());
        assert!(locks.try_acquire("s1").is_none());
        // A different session is unaffected
        assert!(locks.try_acquire("s2").is_some());
    }

    #[test]
    fn test_drop_releases() {
        let locks = SessionLocks::new();
        drop(locks.try_acquire("s1"));
        assert!(locks.try_acquire("s1").is_some());
    }
}
