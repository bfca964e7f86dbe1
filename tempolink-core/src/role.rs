//! Leadership election and transfer.
//!
//! As with `registry`, every method here assumes the caller already holds
//! the per-session lock for the session in question.

use std::sync::Arc;

use tempolink_types::session::SessionPatch;
use tempolink_types::{ConnectionId, Member, Role, Session, SessionId};

use crate::error::{CoordinatorError, NotFoundKind};

/// What happened as a result of `request_leader`.
pub enum RequestLeaderOutcome {
    /// The session had no leader; `connection_id` was assigned immediately.
    Assigned(LeaderAssigned),
    /// The session already has a leader; the request is now queued.
    Pending {
        current_leader: ConnectionId,
        requester: Member,
    },
}

pub struct LeaderAssigned {
    pub session: Session,
}

pub struct LeaderApproved {
    pub session: Session,
    pub previous_leader: ConnectionId,
    /// Other requesters whose pending request was superseded by this
    /// approval and must be told `leaderRequestDenied{reason:"superseded"}`.
    pub superseded: Vec<ConnectionId>,
}

/// The outcome of a leader disconnecting or leaving (the automatic
/// takeover rule). `None` means the departing connection was not the
/// leader, so nothing about leadership changes.
pub struct LeaderAutoAssignment {
    pub session: Session,
    pub new_leader: Option<ConnectionId>,
    pub previous_leader: ConnectionId,
    /// Pending requests dropped because the leader seat changed out from
    /// under them.
    pub cleared_requesters: Vec<ConnectionId>,
}

pub struct RoleManager {
    store: Arc<dyn tempolink_store::Store>,
}

impl RoleManager {
    pub fn new(store: Arc<dyn tempolink_store::Store>) -> Self {
        Self { store }
    }

    fn session(&self, session_id: &SessionId) -> Result<Session, CoordinatorError> {
        self.store
            .get_session(session_id)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))
    }

    fn member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Member, CoordinatorError> {
        self.store
            .get_member(session_id, connection_id)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Member))
    }

    fn set_role(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        role: Role,
    ) -> Result<(), CoordinatorError> {
        let mut member = self.member(session_id, connection_id)?;
        member.role = role;
        self.store.update_member(member)?;
        Ok(())
    }

    /// If the session has no leader, the requester is assigned
    /// immediately. Otherwise the request is queued (at most one pending
    /// request per `(session, requester)`; a repeat request refreshes it).
    pub fn request_leader(
        &self,
        session_id: &SessionId,
        requester: &ConnectionId,
    ) -> Result<RequestLeaderOutcome, CoordinatorError> {
        let session = self.session(session_id)?;
        let requester_member = self.member(session_id, requester)?;

        if let Some(current_leader) = session.leader_connection_id.clone() {
            if &current_leader == requester {
                // Already the leader; nothing to request.
                return Ok(RequestLeaderOutcome::Assigned(LeaderAssigned { session }));
            }
            self.store
                .add_leader_request(tempolink_types::LeaderRequest::new(
                    session_id.clone(),
                    requester.clone(),
                ))?;
            return Ok(RequestLeaderOutcome::Pending {
                current_leader,
                requester: requester_member,
            });
        }

        self.store
            .remove_leader_request(session_id, requester)?;
        self.set_role(session_id, requester, Role::Leader)?;
        let patch = SessionPatch {
            leader_connection_id: Some(Some(requester.clone())),
            ..Default::default()
        };
        let session = self
            .store
            .update_session(session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))?;
        Ok(RequestLeaderOutcome::Assigned(LeaderAssigned { session }))
    }

    /// The current leader approves a pending request, transferring
    /// leadership and resetting `isPlaying` to false (a handoff always
    /// stops playback). All other pending requests are superseded.
    pub fn approve_leader_request(
        &self,
        session_id: &SessionId,
        leader: &ConnectionId,
        requester: &ConnectionId,
    ) -> Result<LeaderApproved, CoordinatorError> {
        let session = self.session(session_id)?;
        if session.leader_connection_id.as_ref() != Some(leader) {
            return Err(CoordinatorError::Authorization {
                current_leader: session.leader_connection_id,
            });
        }

        let pending = self.store.clear_leader_requests(session_id)?;
        let approved = pending.iter().any(|r| &r.connection_id == requester);
        if !approved {
            // Restore the requests we just cleared; none of them matched.
            for request in pending {
                self.store.add_leader_request(request)?;
            }
            return Err(CoordinatorError::Conflict);
        }

        self.set_role(session_id, leader, Role::Follower)?;
        self.set_role(session_id, requester, Role::Leader)?;
        let patch = SessionPatch {
            leader_connection_id: Some(Some(requester.clone())),
            is_playing: Some(false),
            ..Default::default()
        };
        let session = self
            .store
            .update_session(session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))?;

        let superseded = pending
            .into_iter()
            .map(|r| r.connection_id)
            .filter(|id| id != requester)
            .collect();

        Ok(LeaderApproved {
            session,
            previous_leader: leader.clone(),
            superseded,
        })
    }

    /// The current leader denies a single pending request.
    pub fn deny_leader_request(
        &self,
        session_id: &SessionId,
        leader: &ConnectionId,
        requester: &ConnectionId,
    ) -> Result<(), CoordinatorError> {
        let session = self.session(session_id)?;
        if session.leader_connection_id.as_ref() != Some(leader) {
            return Err(CoordinatorError::Authorization {
                current_leader: session.leader_connection_id,
            });
        }
        self.store
            .remove_leader_request(session_id, requester)?
            .ok_or(CoordinatorError::Conflict)?;
        Ok(())
    }

    /// Automatic takeover when the leader disconnects (or leaves).
    /// Call this *after* the departing member has already been removed
    /// from the session's member list, so `remaining_members` excludes
    /// them. The senior remaining member (earliest `joinedAt`, ties broken
    /// by `connectionId`) becomes leader; if no members remain, the
    /// session is left leaderless.
    pub fn handle_leader_departure(
        &self,
        session_id: &SessionId,
        departed: &ConnectionId,
        remaining_members: &[Member],
    ) -> Result<Option<LeaderAutoAssignment>, CoordinatorError> {
        let session = self.session(session_id)?;
        if session.leader_connection_id.as_ref() != Some(departed) {
            return Ok(None);
        }

        let pending = self.store.clear_leader_requests(session_id)?;
        let cleared_requesters = pending.into_iter().map(|r| r.connection_id).collect();

        let senior = remaining_members.iter().min_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then(a.connection_id.cmp(&b.connection_id))
        });

        let Some(senior) = senior else {
            let patch = SessionPatch {
                leader_connection_id: Some(None),
                is_playing: Some(false),
                ..Default::default()
            };
            let session = self
                .store
                .update_session(session_id, &patch)?
                .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))?;
            return Ok(Some(LeaderAutoAssignment {
                session,
                new_leader: None,
                previous_leader: departed.clone(),
                cleared_requesters,
            }));
        };

        self.set_role(session_id, &senior.connection_id, Role::Leader)?;
        let patch = SessionPatch {
            leader_connection_id: Some(Some(senior.connection_id.clone())),
            is_playing: Some(false),
            ..Default::default()
        };
        let session = self
            .store
            .update_session(session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(NotFoundKind::Session))?;

        Ok(Some(LeaderAutoAssignment {
            new_leader: Some(senior.connection_id.clone()),
            session,
            previous_leader: departed.clone(),
            cleared_requesters,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempolink_store::InMemoryStore;

    fn join(store: &Arc<dyn tempolink_store::Store>, sid: &SessionId, cid: &str) -> ConnectionId {
        let connection_id = ConnectionId::from(cid.to_string());
        store
            .add_member(Member::new(sid.clone(), connection_id.clone(), cid.into()))
            .unwrap();
        connection_id
    }

    #[test]
    fn request_leader_assigns_immediately_when_leaderless() {
        let store: Arc<dyn tempolink_store::Store> =
            Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        store.create_session(Session::new(sid.clone())).unwrap();
        let a = join(&store, &sid, "a");

        let role = RoleManager::new(store);
        match role.request_leader(&sid, &a).unwrap() {
            RequestLeaderOutcome::Assigned(outcome) => {
                assert_eq!(outcome.session.leader_connection_id, Some(a));
            }
            RequestLeaderOutcome::Pending { .. } => panic!("expected immediate assignment"),
        }
    }

    #[test]
    fn request_leader_queues_when_already_led() {
        let store: Arc<dyn tempolink_store::Store> =
            Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        store.create_session(Session::new(sid.clone())).unwrap();
        let a = join(&store, &sid, "a");
        let b = join(&store, &sid, "b");
        store
            .update_session(
                &sid,
                &SessionPatch {
                    leader_connection_id: Some(Some(a.clone())),
                    ..Default::default()
                },
            )
            .unwrap();

        let role = RoleManager::new(store);
        match role.request_leader(&sid, &b).unwrap() {
            RequestLeaderOutcome::Pending { current_leader, .. } => {
                assert_eq!(current_leader, a);
            }
            RequestLeaderOutcome::Assigned(_) => panic!("expected a queued request"),
        }
    }

    #[test]
    fn senior_remaining_member_wins_on_leader_disconnect() {
        let store: Arc<dyn tempolink_store::Store> =
            Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        store.create_session(Session::new(sid.clone())).unwrap();
        let a = join(&store, &sid, "a");
        let b = join(&store, &sid, "b");
        store
            .update_session(
                &sid,
                &SessionPatch {
                    leader_connection_id: Some(Some(a.clone())),
                    ..Default::default()
                },
            )
            .unwrap();

        let role = RoleManager::new(store.clone());
        store.remove_member(&sid, &a).unwrap();
        let remaining = store.list_members(&sid).unwrap();
        let outcome = role
            .handle_leader_departure(&sid, &a, &remaining)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.new_leader, Some(b));
    }

    #[test]
    fn leader_departure_with_no_remaining_members_clears_leader() {
        let store: Arc<dyn tempolink_store::Store> =
            Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        store.create_session(Session::new(sid.clone())).unwrap();
        let a = join(&store, &sid, "a");
        store
            .update_session(
                &sid,
                &SessionPatch {
                    leader_connection_id: Some(Some(a.clone())),
                    ..Default::default()
                },
            )
            .unwrap();

        let role = RoleManager::new(store.clone());
        store.remove_member(&sid, &a).unwrap();
        let outcome = role.handle_leader_departure(&sid, &a, &[]).unwrap().unwrap();
        assert_eq!(outcome.new_leader, None);
        assert!(outcome.session.leader_connection_id.is_none());
    }
}
