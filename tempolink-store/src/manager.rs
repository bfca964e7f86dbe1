//! Selects the active backend at startup and performs live fallback /
//! migration between the durable and in-memory backends. Implements
//! `Store` itself so callers (`tempolink-core::registry` et al.) never
//! need to know which backend is currently serving traffic.
//!
//! The in-memory store doubles as both the standalone backend (when no
//! durable backend is configured) and the live "shadow": every successful
//! mutation made against the durable backend is mirrored into it, so a
//! fallback never needs to read from an already-failing durable backend to
//! reconstruct state — it already has a recent view.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;

use tempolink_types::session::SessionPatch;
use tempolink_types::{ConnectionId, LeaderRequest, Member, Session, SessionId};

use crate::durable::DurableStore;
use crate::error::StoreError;
use crate::memory::InMemoryStore;
use crate::traits::{BackendKind, PubSubHandler, Store, SubscriptionHandle};

#[derive(Debug, Clone)]
pub struct StoreManagerConfig {
    pub redis_url: Option<String>,
    pub session_ttl_secs: u64,
    pub reconnect_probe_interval_secs: u64,
    /// 0 means unbounded.
    pub reconnect_max_attempts: u64,
}

pub struct StoreManager {
    durable_url: Option<String>,
    ttl_secs: u64,
    active: Arc<ArcSwap<dyn Store>>,
    memory: Arc<InMemoryStore>,
    degraded: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU64>,
    probe_interval: Duration,
    max_attempts: u64,
    probe_shutdown: Arc<AtomicBool>,
    probe_handle: Option<thread::JoinHandle<()>>,
    migrations: Arc<AtomicU64>,
}

impl StoreManager {
    pub fn new(config: StoreManagerConfig) -> Self {
        let memory = Arc::new(InMemoryStore::new(Duration::from_secs(config.session_ttl_secs)));

        let (active, degraded): (Arc<dyn Store>, bool) = match &config.redis_url {
            Some(url) => match DurableStore::connect(url, config.session_ttl_secs) {
                Ok(durable) => (Arc::new(durable), false),
                Err(e) => {
                    log::warn!(
                        target: "store",
                        "durable backend unreachable at startup ({e}); starting on in-memory fallback"
                    );
                    (memory.clone() as Arc<dyn Store>, true)
                }
            },
            None => (memory.clone() as Arc<dyn Store>, false),
        };

        let manager = Self {
            durable_url: config.redis_url,
            ttl_secs: config.session_ttl_secs,
            active: Arc::new(ArcSwap::from(active)),
            memory,
            degraded: Arc::new(AtomicBool::new(degraded)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
            probe_interval: Duration::from_secs(config.reconnect_probe_interval_secs),
            max_attempts: config.reconnect_max_attempts,
            probe_shutdown: Arc::new(AtomicBool::new(false)),
            probe_handle: None,
            migrations: Arc::new(AtomicU64::new(0)),
        };
        manager.spawn_probe_if_needed()
    }

    fn spawn_probe_if_needed(mut self) -> Self {
        let Some(url) = self.durable_url.clone() else {
            return self;
        };
        let ttl_secs = self.ttl_secs;
        let active = self.active.clone();
        let memory = self.memory.clone();
        let degraded = self.degraded.clone();
        let attempts = self.reconnect_attempts.clone();
        let interval = self.probe_interval;
        let max_attempts = self.max_attempts;
        let shutdown = self.probe_shutdown.clone();
        let migrations = self.migrations.clone();

        let handle = thread::Builder::new()
            .name("tempolink-store-probe".into())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if !degraded.load(Ordering::SeqCst) {
                        continue;
                    }
                    if max_attempts > 0 && attempts.load(Ordering::SeqCst) >= max_attempts {
                        continue;
                    }
                    attempts.fetch_add(1, Ordering::SeqCst);
                    match DurableStore::connect(&url, ttl_secs) {
                        Ok(durable) => {
                            log::info!(target: "store", "durable backend reachable again; migrating back");
                            if let Err(e) = migrate(memory.as_ref(), &durable) {
                                log::warn!(target: "store", "migration back to durable failed: {e}");
                                continue;
                            }
                            migrations.fetch_add(1, Ordering::SeqCst);
                            active.store(Arc::new(durable) as Arc<dyn Store>);
                            degraded.store(false, Ordering::SeqCst);
                            attempts.store(0, Ordering::SeqCst);
                        }
                        Err(_) => continue,
                    }
                }
            })
            .expect("failed to spawn store reconnection probe thread");
        self.probe_handle = Some(handle);
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn active_backend_kind(&self) -> BackendKind {
        self.active.load().backend_kind()
    }

    /// Count of backend swaps since startup: one per fallback to
    /// in-memory and one per successful migration back to the durable
    /// backend. Surfaced by `TelemetryBus` as `migrations`.
    pub fn migration_count(&self) -> u64 {
        self.migrations.load(Ordering::SeqCst)
    }

    fn trigger_fallback(&self, reason: &str) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!(target: "store", "durable backend lost ({reason}); falling back to in-memory");
        self.migrations.fetch_add(1, Ordering::SeqCst);
        self.active
            .store(self.memory.clone() as Arc<dyn Store>);
    }

    fn is_active_durable(&self) -> bool {
        self.active.load().backend_kind() == BackendKind::Durable
    }

    /// Runs `op` against the active backend; on a connection-lost error
    /// from the durable backend, falls back and retries once against
    /// memory.
    fn call<T>(&self, op: impl Fn(&dyn Store) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let active = self.active.load_full();
        match op(active.as_ref()) {
            Ok(v) => Ok(v),
            Err(e) if e.is_connection_lost() && self.is_active_durable() => {
                self.trigger_fallback(&e.to_string());
                op(self.memory.as_ref())
            }
            Err(e) => Err(e),
        }
    }

    fn mirror_session(&self, session: &Session) {
        if !self.is_active_durable() {
            return;
        }
        let patch = SessionPatch {
            message: Some(session.message.clone()),
            tempo_bpm: Some(session.tempo_bpm),
            position_ms: Some(session.position_ms),
            is_playing: Some(session.is_playing),
            leader_connection_id: Some(session.leader_connection_id.clone()),
            max_members: Some(session.settings.max_members),
        };
        if self.memory.get_session(&session.session_id).ok().flatten().is_none() {
            let _ = self.memory.create_session(session.clone());
        } else {
            let _ = self.memory.update_session(&session.session_id, &patch);
        }
    }

    fn mirror_member(&self, member: &Member) {
        if self.is_active_durable() {
            let _ = self.memory.add_member(member.clone());
        }
    }
}

impl Drop for StoreManager {
    fn drop(&mut self) {
        self.probe_shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.probe_handle.take() {
            let _ = handle.join();
        }
    }
}

fn migrate(from: &InMemoryStore, to: &DurableStore) -> Result<(), StoreError> {
    for session in from.list_sessions()? {
        let id = session.session_id.clone();
        if to.get_session(&id)?.is_none() {
            to.create_session(session)?;
        }
        for member in from.list_members(&id)? {
            to.add_member(member)?;
        }
        for request in from.list_leader_requests(&id)? {
            to.add_leader_request(request)?;
        }
    }
    Ok(())
}

impl Store for StoreManager {
    fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        let created = self.call(|s| s.create_session(session.clone()))?;
        self.mirror_session(&created);
        Ok(created)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.call(|s| s.get_session(session_id))
    }

    fn update_session(
        &self,
        session_id: &SessionId,
        patch: &SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        let result = self.call(|s| s.update_session(session_id, patch))?;
        if let Some(ref session) = result {
            self.mirror_session(session);
        }
        Ok(result)
    }

    fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let removed = self.call(|s| s.delete_session(session_id))?;
        let _ = self.memory.delete_session(session_id);
        Ok(removed)
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.call(|s| s.list_sessions())
    }

    fn add_member(&self, member: Member) -> Result<Member, StoreError> {
        let added = self.call(|s| s.add_member(member.clone()))?;
        self.mirror_member(&added);
        Ok(added)
    }

    fn remove_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<Member>, StoreError> {
        let removed = self.call(|s| s.remove_member(session_id, connection_id))?;
        if self.is_active_durable() {
            let _ = self.memory.remove_member(session_id, connection_id);
        }
        Ok(removed)
    }

    fn update_member(&self, member: Member) -> Result<Member, StoreError> {
        let updated = self.call(|s| s.update_member(member.clone()))?;
        self.mirror_member(&updated);
        Ok(updated)
    }

    fn get_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<Member>, StoreError> {
        self.call(|s| s.get_member(session_id, connection_id))
    }

    fn list_members(&self, session_id: &SessionId) -> Result<Vec<Member>, StoreError> {
        self.call(|s| s.list_members(session_id))
    }

    fn member_count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.call(|s| s.member_count(session_id))
    }

    fn set_session_by_connection(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<(), StoreError> {
        self.call(|s| s.set_session_by_connection(connection_id, session_id))?;
        if self.is_active_durable() {
            let _ = self
                .memory
                .set_session_by_connection(connection_id, session_id);
        }
        Ok(())
    }

    fn get_session_by_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<SessionId>, StoreError> {
        self.call(|s| s.get_session_by_connection(connection_id))
    }

    fn remove_connection_index(&self, connection_id: &ConnectionId) -> Result<(), StoreError> {
        self.call(|s| s.remove_connection_index(connection_id))?;
        if self.is_active_durable() {
            let _ = self.memory.remove_connection_index(connection_id);
        }
        Ok(())
    }

    fn add_leader_request(&self, request: LeaderRequest) -> Result<(), StoreError> {
        self.call(|s| s.add_leader_request(request.clone()))?;
        if self.is_active_durable() {
            let _ = self.memory.add_leader_request(request);
        }
        Ok(())
    }

    fn remove_leader_request(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<LeaderRequest>, StoreError> {
        let removed = self.call(|s| s.remove_leader_request(session_id, connection_id))?;
        if self.is_active_durable() {
            let _ = self.memory.remove_leader_request(session_id, connection_id);
        }
        Ok(removed)
    }

    fn list_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError> {
        self.call(|s| s.list_leader_requests(session_id))
    }

    fn clear_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError> {
        let removed = self.call(|s| s.clear_leader_requests(session_id))?;
        if self.is_active_durable() {
            let _ = self.memory.clear_leader_requests(session_id);
        }
        Ok(removed)
    }

    fn publish_to_session(
        &self,
        session_id: &SessionId,
        event_name: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        match self.active.load().publish_to_session(session_id, event_name, payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::debug!(target: "store", "publish_to_session failed (advisory only): {e}");
                Ok(())
            }
        }
    }

    fn subscribe_to_session(
        &self,
        session_id: &SessionId,
        handler: PubSubHandler,
    ) -> Result<SubscriptionHandle, StoreError> {
        self.active.load().subscribe_to_session(session_id, handler)
    }

    fn health_check(&self) -> bool {
        self.active.load().health_check()
    }

    fn backend_kind(&self) -> BackendKind {
        self.active.load().backend_kind()
    }
}
