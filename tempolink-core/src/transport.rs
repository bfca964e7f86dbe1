//! The authoritative transport state machine and its per-session position
//! tick loop.
//!
//! `play`/`pause`/`stop`/`seek`/`set_tempo` assume the caller already holds
//! the per-session lock (same convention as `registry`/`role`). The tick
//! loop is different: it runs on its own thread and must acquire that lock
//! itself on every iteration, since nothing else serializes it against
//! concurrent commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempolink_types::session::{is_valid_tempo, SessionPatch};
use tempolink_types::{ConnectionId, Session, SessionId};

use crate::error::CoordinatorError;
use crate::locks::SessionLocks;

/// Receives a tick's fresh `(positionMs, tempoBpm, serverTimestamp)` so the
/// caller (`coordinator`) can fan it out as `scrollTick`. Kept as a plain
/// callback rather than a dependency on `EventSink` directly, so
/// `transport` does not need to know about session membership or fan-out
/// ordering — `coordinator` wires that up.
pub type TickObserver = Arc<dyn Fn(&SessionId, u64, u16, u64) + Send + Sync>;

struct TickHandle {
    stop: Arc<AtomicBool>,
    _handle: thread::JoinHandle<()>,
}

pub struct TransportEngine {
    store: Arc<dyn tempolink_store::Store>,
    locks: Arc<SessionLocks>,
    tick_period: Duration,
    on_tick: TickObserver,
    ticks: Mutex<HashMap<SessionId, TickHandle>>,
}

impl TransportEngine {
    pub fn new(
        store: Arc<dyn tempolink_store::Store>,
        locks: Arc<SessionLocks>,
        tick_period: Duration,
        on_tick: TickObserver,
    ) -> Self {
        Self {
            store,
            locks,
            tick_period,
            on_tick,
            ticks: Mutex::new(HashMap::new()),
        }
    }

    fn require_leader(session: &Session, caller: &ConnectionId) -> Result<(), CoordinatorError> {
        if session.leader_connection_id.as_ref() == Some(caller) {
            Ok(())
        } else {
            Err(CoordinatorError::Authorization {
                current_leader: session.leader_connection_id.clone(),
            })
        }
    }

    pub fn play(&self, session: &Session, caller: &ConnectionId) -> Result<Session, CoordinatorError> {
        Self::require_leader(session, caller)?;
        let patch = SessionPatch {
            is_playing: Some(true),
            ..Default::default()
        };
        let updated = self
            .store
            .update_session(&session.session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(crate::error::NotFoundKind::Session))?;
        self.ensure_tick_loop(updated.session_id.clone());
        Ok(updated)
    }

    pub fn pause(&self, session: &Session, caller: &ConnectionId) -> Result<Session, CoordinatorError> {
        Self::require_leader(session, caller)?;
        let patch = SessionPatch {
            is_playing: Some(false),
            ..Default::default()
        };
        let updated = self
            .store
            .update_session(&session.session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(crate::error::NotFoundKind::Session))?;
        self.stop_tick_loop(&updated.session_id);
        Ok(updated)
    }

    pub fn stop(&self, session: &Session, caller: &ConnectionId) -> Result<Session, CoordinatorError> {
        Self::require_leader(session, caller)?;
        let patch = SessionPatch {
            is_playing: Some(false),
            position_ms: Some(0),
            ..Default::default()
        };
        let updated = self
            .store
            .update_session(&session.session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(crate::error::NotFoundKind::Session))?;
        self.stop_tick_loop(&updated.session_id);
        Ok(updated)
    }

    /// Accepted in any transport state.
    pub fn seek(
        &self,
        session: &Session,
        caller: &ConnectionId,
        position_ms: u64,
    ) -> Result<Session, CoordinatorError> {
        Self::require_leader(session, caller)?;
        let patch = SessionPatch {
            position_ms: Some(position_ms),
            ..Default::default()
        };
        Ok(self
            .store
            .update_session(&session.session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(crate::error::NotFoundKind::Session))?)
    }

    pub fn set_tempo(
        &self,
        session: &Session,
        caller: &ConnectionId,
        tempo_bpm: u16,
    ) -> Result<Session, CoordinatorError> {
        Self::require_leader(session, caller)?;
        if !is_valid_tempo(tempo_bpm) {
            return Err(CoordinatorError::Validation(format!(
                "tempoBpm {tempo_bpm} out of range"
            )));
        }
        let patch = SessionPatch {
            tempo_bpm: Some(tempo_bpm),
            ..Default::default()
        };
        Ok(self
            .store
            .update_session(&session.session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(crate::error::NotFoundKind::Session))?)
    }

    /// Stops whatever tick loop is running for `session_id`, if any. Used
    /// when a session's membership drops to zero or leadership changes
    /// hands (a handoff always stops playback, per `role::approve_leader_request`).
    pub fn stop_tick_loop(&self, session_id: &SessionId) {
        if let Some(handle) = self.ticks.lock().remove(session_id) {
            handle.stop.store(true, Ordering::SeqCst);
            // Deliberately not joined here: this may run inside the very
            // per-session critical section the tick thread needs to exit.
        }
    }

    /// Stops every running tick loop. Called on shutdown.
    pub fn stop_all(&self) {
        for (_, handle) in self.ticks.lock().drain() {
            handle.stop.store(true, Ordering::SeqCst);
        }
    }

    fn ensure_tick_loop(&self, session_id: SessionId) {
        let mut ticks = self.ticks.lock();
        if ticks.contains_key(&session_id) {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let store = self.store.clone();
            let locks = self.locks.clone();
            let tick_period = self.tick_period;
            let on_tick = self.on_tick.clone();
            let session_id = session_id.clone();
            thread::spawn(move || tick_loop(session_id, store, locks, tick_period, stop, on_tick))
        };
        ticks.insert(session_id, TickHandle { stop, _handle: handle });
    }
}

/// Advances `positionMs` by wall-clock elapsed time each period, not by a
/// fixed increment, so a slow tick (GC pause, scheduling jitter) does not
/// leave the session behind; a missed tick is never retried.
fn tick_loop(
    session_id: SessionId,
    store: Arc<dyn tempolink_store::Store>,
    locks: Arc<SessionLocks>,
    tick_period: Duration,
    stop: Arc<AtomicBool>,
    on_tick: TickObserver,
) {
    let mut last_tick = Instant::now();
    loop {
        thread::sleep(tick_period);
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let lock = locks.lock_for(&session_id);
        let _guard = lock.lock();

        let Ok(Some(session)) = store.get_session(&session_id) else {
            return;
        };
        if !session.is_playing {
            return;
        }

        let now = Instant::now();
        let elapsed_ms = now.duration_since(last_tick).as_millis() as u64;
        last_tick = now;
        let new_position = session.position_ms + elapsed_ms;

        let patch = SessionPatch {
            position_ms: Some(new_position),
            ..Default::default()
        };
        match store.update_session(&session_id, &patch) {
            Ok(Some(updated)) => {
                on_tick(
                    &session_id,
                    updated.position_ms,
                    updated.tempo_bpm,
                    tempolink_types::now_ms(),
                );
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempolink_store::InMemoryStore;

    fn session_with_leader(
        store: &Arc<dyn tempolink_store::Store>,
        sid: &SessionId,
        leader: &ConnectionId,
    ) -> Session {
        store.create_session(Session::new(sid.clone())).unwrap();
        store
            .update_session(
                sid,
                &SessionPatch {
                    leader_connection_id: Some(Some(leader.clone())),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn non_leader_cannot_control_transport() {
        let store: Arc<dyn tempolink_store::Store> = Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        let leader = ConnectionId::from("leader".to_string());
        let session = session_with_leader(&store, &sid, &leader);
        let locks = Arc::new(SessionLocks::new());
        let engine = TransportEngine::new(store, locks, Duration::from_millis(100), Arc::new(|_, _, _, _| {}));

        let intruder = ConnectionId::from("intruder".to_string());
        let err = engine.play(&session, &intruder).unwrap_err();
        assert!(matches!(err, CoordinatorError::Authorization { .. }));
    }

    #[test]
    fn set_tempo_rejects_out_of_range_values() {
        let store: Arc<dyn tempolink_store::Store> = Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        let leader = ConnectionId::from("leader".to_string());
        let session = session_with_leader(&store, &sid, &leader);
        let locks = Arc::new(SessionLocks::new());
        let engine = TransportEngine::new(store, locks, Duration::from_millis(100), Arc::new(|_, _, _, _| {}));

        let err = engine.set_tempo(&session, &leader, 301).unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[test]
    fn stop_resets_position_to_zero() {
        let store: Arc<dyn tempolink_store::Store> = Arc::new(InMemoryStore::new(Duration::from_secs(1800)));
        let sid = SessionId::from("s1");
        let leader = ConnectionId::from("leader".to_string());
        let session = session_with_leader(&store, &sid, &leader);
        let locks = Arc::new(SessionLocks::new());
        let engine = TransportEngine::new(store, locks, Duration::from_millis(100), Arc::new(|_, _, _, _| {}));

        engine.seek(&session, &leader, 5000).unwrap();
        let session = engine.store.get_session(&sid).unwrap().unwrap();
        let stopped = engine.stop(&session, &leader).unwrap();
        assert_eq!(stopped.position_ms, 0);
        assert!(!stopped.is_playing);
    }
}
