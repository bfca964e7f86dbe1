//! The abstract `Store` contract. Two implementations
//! exist — [`crate::memory::InMemoryStore`] and [`crate::durable::DurableStore`]
//! — and must expose identical observable semantics except for the
//! cross-process fan-out of pub/sub.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tempolink_types::{ConnectionId, LeaderRequest, Member, Session, SessionId};

use crate::error::StoreError;
use tempolink_types::session::SessionPatch;

/// Which concrete backend is currently serving traffic. Surfaced to
/// `TelemetryBus` so the health endpoint can report
/// degraded mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
 Durable,
 InMemory,
}

/// A live subscription to a session's pub/sub channel. Dropping it stops
/// the background listener.
pub struct SubscriptionHandle {
 stop: Arc<AtomicBool>,
 handle: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
 pub(crate) fn new(stop: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
 Self {
 stop,
 handle: Some(handle),
 }
 }

 /// A handle representing no active subscription (used by backends that
 /// implement pub/sub as a no-op).
 pub(crate) fn noop() -> Self {
 Self {
 stop: Arc::new(AtomicBool::new(true)),
 handle: None,
 }
 }
}

impl Drop for SubscriptionHandle {
 fn drop(&mut self) {
 self.stop.store(true, Ordering::SeqCst);
 if let Some(handle) = self.handle.take() {
 let _ = handle.join();
 }
 }
}

pub type PubSubHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Abstract key/value and pub/sub contract for sessions, members, and
/// pending leader requests.
pub trait Store: Send + Sync {
 fn create_session(&self, session: Session) -> Result<Session, StoreError>;
 fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError>;
 fn update_session(
 &self,
 session_id: &SessionId,
 patch: &SessionPatch,
 ) -> Result<Option<Session>, StoreError>;
 fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError>;
 fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

 fn add_member(&self, member: Member) -> Result<Member, StoreError>;
 fn remove_member(
 &self,
 session_id: &SessionId,
 connection_id: &ConnectionId,
 ) -> Result<Option<Member>, StoreError>;
 fn update_member(&self, member: Member) -> Result<Member, StoreError>;
 fn get_member(
 &self,
 session_id: &SessionId,
 connection_id: &ConnectionId,
 ) -> Result<Option<Member>, StoreError>;
 fn list_members(&self, session_id: &SessionId) -> Result<Vec<Member>, StoreError>;
 fn member_count(&self, session_id: &SessionId) -> Result<usize, StoreError>;

 fn set_session_by_connection(
 &self,
 connection_id: &ConnectionId,
 session_id: &SessionId,
 ) -> Result<(), StoreError>;
 fn get_session_by_connection(
 &self,
 connection_id: &ConnectionId,
 ) -> Result<Option<SessionId>, StoreError>;
 fn remove_connection_index(&self, connection_id: &ConnectionId) -> Result<(), StoreError>;

 fn add_leader_request(&self, request: LeaderRequest) -> Result<(), StoreError>;
 fn remove_leader_request(
 &self,
 session_id: &SessionId,
 connection_id: &ConnectionId,
 ) -> Result<Option<LeaderRequest>, StoreError>;
 /// Ordered by `requestedAt`, oldest first.
 fn list_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError>;
 fn clear_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError>;

 fn publish_to_session(
 &self,
 session_id: &SessionId,
 event_name: &str,
 payload: &[u8],
 ) -> Result<(), StoreError>;
 fn subscribe_to_session(
 &self,
 session_id: &SessionId,
 handler: PubSubHandler,
 ) -> Result<SubscriptionHandle, StoreError>;

 fn health_check(&self) -> bool;
 fn backend_kind(&self) -> BackendKind;
}
