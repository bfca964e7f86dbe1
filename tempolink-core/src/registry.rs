//! Session lifecycle and membership: lazy session
//! creation on first join, capacity enforcement, and the idle sweep that
//! deletes empty sessions once they age past their TTL.
//!
//! Every method here assumes the caller already holds the per-session lock
//! for `session_id` (see `coordinator::SessionLocks`) when the operation
//! reads-modifies-writes a session; none of these methods lock anything
//! themselves.

use std::sync::Arc;
use std::time::Duration;

use tempolink_types::session::SessionPatch;
use tempolink_types::{ConnectionId, Member, Session, SessionId};

use crate::error::{CoordinatorError, NotFoundKind};

/// The result of a successful `joinSession`.
pub struct JoinOutcome {
    pub session: Session,
    pub member: Member,
    pub members: Vec<Member>,
    /// True if the session had no leader before this member was added —
    /// the caller (`coordinator`) uses this to trigger the "first joiner
    /// becomes leader" rule rather than `registry` deciding leadership
    /// itself, keeping that policy in one place (`role.rs`).
    pub session_was_leaderless: bool,
}

/// The result of a successful `leaveSession`.
pub struct LeaveOutcome {
    pub member: Member,
    pub remaining_members: Vec<Member>,
    pub was_leader: bool,
}

pub struct SessionRegistry {
    store: Arc<dyn tempolink_store::Store>,
    default_max_members: u32,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn tempolink_store::Store>,
        default_max_members: u32,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            store,
            default_max_members,
            idle_ttl,
        }
    }

    /// Fetches a session, creating it with the default transport state
    /// (`tempoBpm = 120`, `positionMs = 0`, `isPlaying = false`, no
    /// leader) if it does not already exist.
    fn get_or_create(&self, session_id: &SessionId) -> Result<Session, CoordinatorError> {
        if let Some(session) = self.store.get_session(session_id)? {
            return Ok(session);
        }
        let mut session = Session::new(session_id.clone());
        session.settings.max_members = self.default_max_members;
        match self.store.create_session(session) {
            Ok(session) => Ok(session),
            Err(_) => self
                .store
                .get_session(session_id)?
                .ok_or(CoordinatorError::NotFound(NotFoundKind::Session)),
        }
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Session, CoordinatorError> {
        self.store
            .get_session(session_id)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))
    }

    pub fn get_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Member, CoordinatorError> {
        self.store
            .get_member(session_id, connection_id)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Member))
    }

    pub fn list_members(&self, session_id: &SessionId) -> Result<Vec<Member>, CoordinatorError> {
        Ok(self.store.list_members(session_id)?)
    }

    /// Adds `connection_id` to `session_id`, creating the session lazily.
    /// Fails with `Capacity` once the session already holds
    /// `settings.max_members` members, leaving state untouched.
    pub fn join(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        display_name: String,
    ) -> Result<JoinOutcome, CoordinatorError> {
        let session = self.get_or_create(session_id)?;
        let current_count = self.store.member_count(session_id)?;
        if current_count >= session.settings.max_members as usize {
            return Err(CoordinatorError::Capacity);
        }

        let member = Member::new(session_id.clone(), connection_id.clone(), display_name);
        let member = self.store.add_member(member)?;
        self.store
            .set_session_by_connection(&connection_id, session_id)?;
        let session = self
            .store
            .update_session(session_id, &SessionPatch::default())?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))?;
        let members = self.store.list_members(session_id)?;

        Ok(JoinOutcome {
            session_was_leaderless: session.leader_connection_id.is_none(),
            session,
            member,
            members,
        })
    }

    /// Removes `connection_id` from `session_id`. Returns `Ok(None)` if the
    /// connection was not a member (idempotent, matching the teacher's
    /// `remove_client` behavior for an already-gone client).
    pub fn leave(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<LeaveOutcome>, CoordinatorError> {
        let Some(member) = self.store.remove_member(session_id, connection_id)? else {
            return Ok(None);
        };
        self.store.remove_connection_index(connection_id)?;
        let session = self
            .store
            .update_session(session_id, &SessionPatch::default())?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))?;
        let remaining_members = self.store.list_members(session_id)?;

        Ok(Some(LeaveOutcome {
            was_leader: session.leader_connection_id.as_ref() == Some(connection_id),
            member,
            remaining_members,
        }))
    }

    /// Deletes sessions with zero members whose `lastActiveAt` has aged
    /// past the idle TTL. Called periodically by
    /// `coordinator::Coordinator::run_idle_sweep`.
    pub fn sweep_idle(&self) -> Result<u64, CoordinatorError> {
        let now = tempolink_types::time::now_ms();
        let ttl_ms = self.idle_ttl.as_millis() as u64;
        let mut swept = 0;
        for session in self.store.list_sessions()? {
            if self.store.member_count(&session.session_id)? == 0
                && now.saturating_sub(session.last_active_at) >= ttl_ms
                && self.store.delete_session(&session.session_id)?
            {
                swept += 1;
                log::info!(target: "registry", "swept idle session {}", session.session_id);
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempolink_store::InMemoryStore;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(InMemoryStore::new(Duration::from_secs(1800))),
            2,
            Duration::from_secs(1800),
        )
    }

    #[test]
    fn first_join_creates_session_and_reports_leaderless() {
        let registry = registry();
        let sid = SessionId::from("s1");
        let outcome = registry
            .join(&sid, ConnectionId::from("c1".to_string()), "Alice".into())
            .unwrap();
        assert!(outcome.session_was_leaderless);
        assert_eq!(outcome.members.len(), 1);
    }

    #[test]
    fn join_beyond_capacity_is_rejected() {
        let registry = registry();
        let sid = SessionId::from("s1");
        registry
            .join(&sid, ConnectionId::from("c1".to_string()), "A".into())
            .unwrap();
        registry
            .join(&sid, ConnectionId::from("c2".to_string()), "B".into())
            .unwrap();
        let err = registry
            .join(&sid, ConnectionId::from("c3".to_string()), "C".into())
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Capacity));
    }

    #[test]
    fn leave_reports_whether_departing_member_was_leader() {
        let registry = registry();
        let sid = SessionId::from("s1");
        let c1 = ConnectionId::from("c1".to_string());
        registry.join(&sid, c1.clone(), "A".into()).unwrap();
        // not yet leader until role.rs assigns it; simulate directly.
        let outcome = registry.leave(&sid, &c1).unwrap().unwrap();
        assert_eq!(outcome.remaining_members.len(), 0);
        assert!(!outcome.was_leader);
    }

    #[test]
    fn leave_unknown_connection_is_a_noop() {
        let registry = registry();
        let sid = SessionId::from("s1");
        registry
            .join(&sid, ConnectionId::from("c1".to_string()), "A".into())
            .unwrap();
        let outcome = registry
            .leave(&sid, &ConnectionId::from("ghost".to_string()))
            .unwrap();
        assert!(outcome.is_none());
    }
}
