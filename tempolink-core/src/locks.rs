//! Per-session locking discipline: a coarse lock guards the
//! session-id-to-lock table itself, held only long enough to look up or
//! insert an entry, then released before the caller acquires the
//! per-session lock it returned. Every read-modify-write sequence against
//! a single session — whether from `coordinator`'s command dispatch or
//! from a `transport` tick — goes through that per-session lock, so
//! sessions never interfere with each other but a session's own state
//! transitions are always serialized.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tempolink_types::SessionId;

pub struct SessionLocks {
    table: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the lock for `session_id`, creating it if this is the first
    /// time it has been referenced. The coarse table lock is released as
    /// soon as this returns.
    pub fn lock_for(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut table = self.table.lock();
        table
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the table entry for a session that no longer needs one (e.g.
    /// after the idle sweep deletes it). Harmless if called while another
    /// `Arc` clone of the lock is still in use elsewhere; the entry is
    /// simply recreated on next access.
    pub fn remove(&self, session_id: &SessionId) {
        self.table.lock().remove(session_id);
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_session_returns_the_same_lock() {
        let locks = SessionLocks::new();
        let sid = SessionId::from("s1");
        let a = locks.lock_for(&sid);
        let b = locks.lock_for(&sid);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_sessions_get_different_locks() {
        let locks = SessionLocks::new();
        let a = locks.lock_for(&SessionId::from("s1"));
        let b = locks.lock_for(&SessionId::from("s2"));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
