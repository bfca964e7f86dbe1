//! Local in-memory `Store` backend. Used standalone when no durable
//! backend is configured, and as `StoreManager`'s fallback when the
//! durable backend becomes unreachable.
//!
//! Grounded on `marmikshah-rtsp-rs`'s `SessionManager`
//! (`src/session/mod.rs`): a coarse `parking_lot::RwLock<HashMap<..>>` per
//! collection, read-locked for lookups and write-locked for mutation.
//!
//! Pub/sub here is a genuine no-op: this backend never
//! fans events out across processes. A deployment that needs cross-process
//! fan-out must run the durable backend — this is a carried-forward
//! limitation, not a bug to fix here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tempolink_types::session::SessionPatch;
use tempolink_types::{ConnectionId, LeaderRequest, Member, Session, SessionId};

use crate::error::StoreError;
use crate::traits::{BackendKind, PubSubHandler, Store, SubscriptionHandle};

type MemberKey = (SessionId, ConnectionId);

pub struct InMemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    members: RwLock<HashMap<MemberKey, Member>>,
    leader_requests: RwLock<HashMap<MemberKey, LeaderRequest>>,
    connection_index: RwLock<HashMap<ConnectionId, SessionId>>,
    idle_ttl: Duration,
    last_swept: RwLock<Instant>,
}

impl InMemoryStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            leader_requests: RwLock::new(HashMap::new()),
            connection_index: RwLock::new(HashMap::new()),
            idle_ttl,
            last_swept: RwLock::new(Instant::now()),
        }
    }

    /// Deletes sessions idle beyond the TTL with zero members.
    /// `StoreManager`/the registry's own sweep timer invoke this; it is
    /// also safe to call opportunistically.
    pub fn sweep_idle(&self, now_ms: u64) -> usize {
        *self.last_swept.write() = Instant::now();
        let idle_ms = self.idle_ttl.as_millis() as u64;
        let members = self.members.read();
        let mut sessions = self.sessions.write();
        let stale: Vec<SessionId> = sessions
            .values()
            .filter(|s| {
                now_ms.saturating_sub(s.last_active_at) > idle_ms
                    && !members.keys().any(|(sid, _)| sid == &s.session_id)
            })
            .map(|s| s.session_id.clone())
            .collect();
        for id in &stale {
            sessions.remove(id);
        }
        stale.len()
    }
}

impl Store for InMemoryStore {
    fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.session_id) {
            return Err(StoreError::AlreadyExists);
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    fn update_session(
        &self,
        session_id: &SessionId,
        patch: &SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        patch.apply(session);
        Ok(Some(session.clone()))
    }

    fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let removed = self.sessions.write().remove(session_id).is_some();
        self.members.write().retain(|(sid, _), _| sid != session_id);
        self.leader_requests
            .write()
            .retain(|(sid, _), _| sid != session_id);
        Ok(removed)
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    fn add_member(&self, member: Member) -> Result<Member, StoreError> {
        let key = (member.session_id.clone(), member.connection_id.clone());
        self.members.write().insert(key, member.clone());
        Ok(member)
    }

    fn remove_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<Member>, StoreError> {
        let key = (session_id.clone(), connection_id.clone());
        Ok(self.members.write().remove(&key))
    }

    fn update_member(&self, member: Member) -> Result<Member, StoreError> {
        let key = (member.session_id.clone(), member.connection_id.clone());
        self.members.write().insert(key, member.clone());
        Ok(member)
    }

    fn get_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<Member>, StoreError> {
        let key = (session_id.clone(), connection_id.clone());
        Ok(self.members.read().get(&key).cloned())
    }

    fn list_members(&self, session_id: &SessionId) -> Result<Vec<Member>, StoreError> {
        Ok(self
            .members
            .read()
            .values()
            .filter(|m| &m.session_id == session_id)
            .cloned()
            .collect())
    }

    fn member_count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        Ok(self
            .members
            .read()
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .count())
    }

    fn set_session_by_connection(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<(), StoreError> {
        self.connection_index
            .write()
            .insert(connection_id.clone(), session_id.clone());
        Ok(())
    }

    fn get_session_by_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<SessionId>, StoreError> {
        Ok(self.connection_index.read().get(connection_id).cloned())
    }

    fn remove_connection_index(&self, connection_id: &ConnectionId) -> Result<(), StoreError> {
        self.connection_index.write().remove(connection_id);
        Ok(())
    }

    fn add_leader_request(&self, request: LeaderRequest) -> Result<(), StoreError> {
        let key = (request.session_id.clone(), request.connection_id.clone());
        self.leader_requests.write().insert(key, request);
        Ok(())
    }

    fn remove_leader_request(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<LeaderRequest>, StoreError> {
        let key = (session_id.clone(), connection_id.clone());
        Ok(self.leader_requests.write().remove(&key))
    }

    fn list_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError> {
        let mut requests: Vec<LeaderRequest> = self
            .leader_requests
            .read()
            .values()
            .filter(|r| &r.session_id == session_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        Ok(requests)
    }

    fn clear_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError> {
        let mut leader_requests = self.leader_requests.write();
        let removed_keys: Vec<MemberKey> = leader_requests
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(removed_keys.len());
        for key in removed_keys {
            if let Some(r) = leader_requests.remove(&key) {
                removed.push(r);
            }
        }
        removed.sort_by_key(|r| r.requested_at);
        Ok(removed)
    }

    fn publish_to_session(
        &self,
        _session_id: &SessionId,
        _event_name: &str,
        _payload: &[u8],
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn subscribe_to_session(
        &self,
        _session_id: &SessionId,
        _handler: PubSubHandler,
    ) -> Result<SubscriptionHandle, StoreError> {
        Ok(SubscriptionHandle::noop())
    }

    fn health_check(&self) -> bool {
        true
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::InMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Duration::from_secs(1800))
    }

    #[test]
    fn create_session_rejects_duplicate() {
        let store = store();
        let session = Session::new(SessionId::from("s1"));
        assert!(store.create_session(session.clone()).is_ok());
        assert!(matches!(
            store.create_session(session),
            Err(StoreError::AlreadyExists)
        ));
    }

    #[test]
    fn update_session_is_last_writer_wins() {
        let store = store();
        let id = SessionId::from("s1");
        store.create_session(Session::new(id.clone())).unwrap();

        let patch = SessionPatch {
            tempo_bpm: Some(140),
            ..Default::default()
        };
        let updated = store.update_session(&id, &patch).unwrap().unwrap();
        assert_eq!(updated.tempo_bpm, 140);
        assert_eq!(updated.position_ms, 0);
    }

    #[test]
    fn member_lifecycle_round_trips() {
        let store = store();
        let session_id = SessionId::from("s1");
        let conn = ConnectionId::generate();
        let member = Member::new(session_id.clone(), conn.clone(), "Alice".into());
        store.add_member(member).unwrap();
        assert_eq!(store.member_count(&session_id).unwrap(), 1);
        store.remove_member(&session_id, &conn).unwrap();
        assert_eq!(store.member_count(&session_id).unwrap(), 0);
    }

    #[test]
    fn leader_requests_are_ordered_by_arrival() {
        let store = store();
        let session_id = SessionId::from("s1");
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        store
            .add_leader_request(LeaderRequest::new(session_id.clone(), a.clone()))
            .unwrap();
        store
            .add_leader_request(LeaderRequest::new(session_id.clone(), b.clone()))
            .unwrap();
        let requests = store.list_leader_requests(&session_id).unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].requested_at <= requests[1].requested_at);
    }

    #[test]
    fn sweep_idle_removes_only_empty_stale_sessions() {
        let store = InMemoryStore::new(Duration::from_millis(0));
        let id = SessionId::from("s1");
        store.create_session(Session::new(id.clone())).unwrap();
        let removed = store.sweep_idle(tempolink_types::now_ms() + 1);
        assert_eq!(removed, 1);
        assert!(store.get_session(&id).unwrap().is_none());
    }
}
