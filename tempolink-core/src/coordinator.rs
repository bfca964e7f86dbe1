//! Wires `registry`, `role`, `transport`, `sync`, and `dispatch` into a
//! single facade that `tempolink-net` drives one `Command` at a time.
//! Owns the per-session locking discipline: every command handler acquires
//! the session's lock before touching it and releases it before
//! returning, so sessions never block each other but a session's own
//! reads/writes are always serialized against its own tick loop and
//! against concurrent commands from its own members.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempolink_store::{PubSubHandler, Store, StoreManager, StoreManagerConfig, SubscriptionHandle};
use tempolink_types::session::SessionPatch;
use tempolink_types::{Command, ConnectionId, Event, Role, SessionId};

use crate::config::{Config, StoreBackendKind};
use crate::dispatch::EventDispatcher;
use crate::error::CoordinatorError;
use crate::locks::SessionLocks;
use crate::registry::SessionRegistry;
use crate::role::RequestLeaderOutcome;
use crate::role::RoleManager;
use crate::sync::SyncEngine;
use crate::telemetry::TelemetryBus;
use crate::transport::TransportEngine;

/// The seam between `tempolink-core`'s domain logic and `tempolink-net`'s
/// sockets: the coordinator decides *what* to send and to *whom*, this
/// trait delivers bytes to one connection. Implemented by the net layer's
/// connection registry/writer thread.
pub trait EventSink: Send + Sync {
    fn send_to(&self, connection_id: &ConnectionId, event: Event);
    /// The sink should close the connection after flushing any queued
    /// frames (persistent rate-limit violators).
    fn disconnect(&self, connection_id: &ConnectionId);
}

pub struct Coordinator {
    store_manager: Arc<StoreManager>,
    registry: SessionRegistry,
    role: RoleManager,
    transport: Arc<TransportEngine>,
    sync: Arc<SyncEngine>,
    dispatcher: EventDispatcher,
    locks: Arc<SessionLocks>,
    sink: Arc<dyn EventSink>,
    telemetry: TelemetryBus,
    /// Unique per process. Prefixed onto every message this instance
    /// publishes so its own subscription handler can ignore its own
    /// publishes — the session's members already got the event directly
    /// from `broadcast_ordered`'s local `sink.send_to` calls.
    instance_id: String,
    /// One live pub/sub subscription per session that has had at least one
    /// local join, realizing the cluster-wide fan-out named in the
    /// architecture: a peer process's `broadcast_ordered` call reaches this
    /// process's local members through here.
    subscriptions: Mutex<HashMap<SessionId, SubscriptionHandle>>,
}

impl Coordinator {
    pub fn new(config: &Config, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let store_manager = Arc::new(StoreManager::new(StoreManagerConfig {
            redis_url: match config.store_backend() {
                StoreBackendKind::Durable => config.redis_url().map(str::to_string),
                StoreBackendKind::Memory => None,
            },
            session_ttl_secs: config.session_ttl_secs(),
            reconnect_probe_interval_secs: config.reconnect_probe_interval_secs(),
            reconnect_max_attempts: config.reconnect_max_attempts(),
        }));
        let store: Arc<dyn Store> = store_manager.clone();

        let locks = Arc::new(SessionLocks::new());
        let sync = Arc::new(SyncEngine::new());

        let transport = {
            let sink = sink.clone();
            let store_for_fanout = store.clone();
            let sync_for_fanout = sync.clone();
            Arc::new(TransportEngine::new(
                store.clone(),
                locks.clone(),
                Duration::from_millis(config.tick_period_ms()),
                Arc::new(move |session_id, position_ms, tempo_bpm, server_timestamp| {
                    fan_out_tick(
                        &store_for_fanout,
                        &sync_for_fanout,
                        sink.as_ref(),
                        session_id,
                        position_ms,
                        tempo_bpm,
                        server_timestamp,
                    );
                }),
            ))
        };

        let telemetry = TelemetryBus::start(
            store_manager.clone(),
            sync.clone(),
            Duration::from_secs(config.telemetry_report_interval_secs()),
            config.health_port(),
        );

        Arc::new(Self {
            registry: SessionRegistry::new(
                store.clone(),
                config.default_max_members(),
                Duration::from_secs(config.session_ttl_secs()),
            ),
            role: RoleManager::new(store.clone()),
            dispatcher: EventDispatcher::new(),
            store_manager,
            transport,
            sync,
            locks,
            sink,
            telemetry,
            instance_id: ConnectionId::generate().to_string(),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn telemetry_snapshot(&self) -> crate::telemetry::TelemetryReport {
        self.telemetry.snapshot()
    }

    pub fn run_idle_sweep(&self) {
        match self.registry.sweep_idle() {
            Ok(count) if count > 0 => {
                log::info!(target: "registry", "idle sweep removed {count} session(s)")
            }
            Ok(_) => {}
            Err(e) => log::error!(target: "registry", "idle sweep failed: {e}"),
        }
    }

    pub fn shutdown(&self) {
        self.transport.stop_all();
    }

    /// Handles one inbound command from `caller`. Emits events via `sink`
    /// directly; never returns anything to the net layer except whether
    /// the connection should now be disconnected (a persistent rate-limit
    /// violator).
    ///
    /// Pipeline order: (1) validation, (2) session resolution, (3) role
    /// authorization, (4) rate limiting, (5) dispatch — a rate-limited
    /// caller is still told `InsufficientRole` rather than being let
    /// through just because their bucket happened to have tokens left.
    pub fn handle_command(&self, caller: &ConnectionId, command: Command) -> bool {
        if let Err(e) = self.dispatcher.validate(&command) {
            self.emit_error(caller, e);
            return false;
        }

        if let Command::LatencyProbe {
            session_id,
            client_timestamp,
        } = &command
        {
            return self.handle_latency_probe(caller, session_id.clone(), *client_timestamp);
        }

        let Some(session_id) = command.session_id().cloned() else {
            return false;
        };

        let lock = self.locks.lock_for(&session_id);
        let _guard = lock.lock();

        // `joinSession` creates the session lazily and is never
        // leader-only, so it has nothing to resolve or authorize against
        // yet; every other session-scoped command must resolve first.
        if !matches!(command, Command::JoinSession { .. }) {
            let session = match self.registry.get_session(&session_id) {
                Ok(session) => session,
                Err(e) => {
                    self.emit_error(caller, e);
                    return false;
                }
            };
            if let Err(e) = self.dispatcher.authorize(&command, &session, caller) {
                self.emit_error(caller, e);
                return false;
            }
        }

        if let Err(e) = self.dispatcher.check_rate_limit(caller, &command) {
            self.emit_error(caller, e);
            return self.dispatcher.should_disconnect(caller);
        }

        if let Err(e) = self.dispatch_locked(caller, &session_id, command) {
            self.emit_error(caller, e);
        }
        false
    }

    /// `latencyProbe` is the one command that may or may not carry a
    /// session id and is never leader-only, so it skips session
    /// resolution/authorization entirely and is handled here rather than
    /// through `dispatch_locked`. When it does carry a session id, it
    /// doubles as the member's liveness ping: `lastPingAt` and
    /// `measuredLatencyMs` on the stored `Member` are refreshed so
    /// `snapshot`/`userJoined` reflect live values instead of the ones
    /// recorded at join time.
    fn handle_latency_probe(
        &self,
        caller: &ConnectionId,
        session_id: Option<SessionId>,
        client_timestamp: u64,
    ) -> bool {
        let probe = Command::LatencyProbe {
            session_id: session_id.clone(),
            client_timestamp,
        };
        if let Err(e) = self.dispatcher.check_rate_limit(caller, &probe) {
            self.emit_error(caller, e);
            return self.dispatcher.should_disconnect(caller);
        }

        let server_timestamp = self.sync.record_probe(caller, client_timestamp);

        if let Some(session_id) = session_id {
            let lock = self.locks.lock_for(&session_id);
            let _guard = lock.lock();
            if let Ok(mut member) = self.registry.get_member(&session_id, caller) {
                member.last_ping_at = server_timestamp;
                member.measured_latency_ms = self.sync.measured_latency_ms(caller);
                let _ = self.store_manager.update_member(member);
            }
        }

        self.sink.send_to(
            caller,
            Event::LatencyResponse {
                client_timestamp,
                server_timestamp,
            },
        );
        false
    }

    /// Called when a connection drops (EOF, reset, or an explicit
    /// `leaveSession` is handled the same way). Removes the connection
    /// from whatever session it belonged to and runs the leader-departure
    /// takeover if it was the leader.
    pub fn handle_disconnect(&self, connection_id: &ConnectionId) {
        self.dispatcher.forget_connection(connection_id);
        self.sync.remove_connection(connection_id);

        let Ok(Some(session_id)) = self.store_manager.get_session_by_connection(connection_id)
        else {
            return;
        };
        let lock = self.locks.lock_for(&session_id);
        let _guard = lock.lock();
        self.on_member_departed(&session_id, connection_id);
    }

    fn dispatch_locked(
        &self,
        caller: &ConnectionId,
        session_id: &SessionId,
        command: Command,
    ) -> Result<(), CoordinatorError> {
        match command {
            Command::JoinSession {
                display_name, role, ..
            } => self.handle_join(session_id, caller, display_name, role),
            Command::LeaveSession { .. } => {
                self.on_member_departed(session_id, caller);
                Ok(())
            }
            Command::SetRole { role, .. } => match role {
                Role::Leader => self.handle_request_leader(session_id, caller),
                Role::Follower => Ok(()),
            },
            Command::RequestLeader { .. } => self.handle_request_leader(session_id, caller),
            Command::ApproveLeaderRequest {
                requester_connection_id,
                ..
            } => self.handle_approve(session_id, caller, &requester_connection_id),
            Command::DenyLeaderRequest {
                requester_connection_id,
                ..
            } => self.handle_deny(session_id, caller, &requester_connection_id),
            Command::Play { .. } => self.handle_transport(session_id, caller, TransportOp::Play),
            Command::Pause { .. } => self.handle_transport(session_id, caller, TransportOp::Pause),
            Command::Stop { .. } => self.handle_transport(session_id, caller, TransportOp::Stop),
            Command::Seek { position_ms, .. } => {
                self.handle_transport(session_id, caller, TransportOp::Seek(position_ms))
            }
            Command::SetTempo { tempo_bpm, .. } => {
                self.handle_transport(session_id, caller, TransportOp::SetTempo(tempo_bpm))
            }
            Command::UpdateMessage { message, .. } => {
                self.handle_update_message(session_id, caller, message)
            }
            Command::SyncRequest {
                reported_position_ms,
                client_timestamp,
                ..
            } => self.handle_sync_request(session_id, caller, reported_position_ms, client_timestamp),
            Command::LatencyProbe { .. } => unreachable!("handled before acquiring the session lock"),
        }
    }

    fn handle_join(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
        display_name: Option<String>,
        requested_role: Option<Role>,
    ) -> Result<(), CoordinatorError> {
        let display_name = display_name.unwrap_or_else(|| caller.as_str().to_string());
        let outcome = self.registry.join(session_id, caller.clone(), display_name)?;
        self.ensure_subscribed(session_id);

        if outcome.session_was_leaderless {
            // First-joiner rule: implicit, no separate broadcast beyond the
            // snapshot/userJoined pair sent below.
            let _ = self.role.request_leader(session_id, caller);
        } else if matches!(requested_role, Some(Role::Leader)) {
            // An explicit `role: leader` on join is sugar for requesting
            // leadership, same as `setRole`/`requestLeader` — never an
            // implicit takeover.
            self.handle_request_leader(session_id, caller)?;
        }

        let session = self.registry.get_session(session_id)?;
        let members = self.registry.list_members(session_id)?;
        let joined_member = members
            .iter()
            .find(|m| &m.connection_id == caller)
            .cloned()
            .unwrap_or(outcome.member);

        self.sink.send_to(
            caller,
            Event::Snapshot {
                session: Box::new(session.clone()),
                members: members.clone(),
                server_timestamp: tempolink_types::now_ms(),
            },
        );
        self.broadcast_ordered(
            session_id,
            Some(caller),
            Event::UserJoined {
                member: joined_member,
                member_count: members.len() as u32,
            },
        );
        self.broadcast_room_stats(session_id, &session, members.len() as u32);
        Ok(())
    }

    fn on_member_departed(&self, session_id: &SessionId, connection_id: &ConnectionId) {
        let Ok(Some(leave)) = self.registry.leave(session_id, connection_id) else {
            return;
        };

        // A pending request by the departing connection itself is removed
        // unconditionally, independent of whether it was the leader — a
        // leader-request record must not outlive its requester's own
        // disconnect, same as it doesn't outlive approval, denial, or a
        // leader change.
        let _ = self.store_manager.remove_leader_request(session_id, connection_id);

        let mut new_leader = None;
        if leave.was_leader {
            if let Ok(Some(assignment)) =
                self.role
                    .handle_leader_departure(session_id, connection_id, &leave.remaining_members)
            {
                new_leader = assignment.new_leader.clone();
                for requester in &assignment.cleared_requesters {
                    self.sink.send_to(
                        requester,
                        Event::LeaderRequestDenied {
                            session_id: session_id.clone(),
                            reason: "leaderChanged".to_string(),
                        },
                    );
                }
                if let Some(new_leader_id) = assignment.new_leader.clone() {
                    self.broadcast_ordered(
                        session_id,
                        None,
                        Event::LeaderAutoAssigned {
                            session_id: session_id.clone(),
                            new_leader_connection_id: new_leader_id,
                            previous_leader_connection_id: Some(connection_id.clone()),
                            reason: "leaderDisconnected".to_string(),
                        },
                    );
                } else {
                    self.transport.stop_tick_loop(session_id);
                }
            }
        }

        self.broadcast_ordered(
            session_id,
            None,
            Event::UserLeft {
                connection_id: connection_id.clone(),
                member_count: leave.remaining_members.len() as u32,
                new_leader,
            },
        );
        if let Ok(session) = self.registry.get_session(session_id) {
            self.broadcast_room_stats(session_id, &session, leave.remaining_members.len() as u32);
        }
        if leave.remaining_members.is_empty() {
            self.maybe_unsubscribe(session_id);
        }
    }

    fn handle_request_leader(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
    ) -> Result<(), CoordinatorError> {
        match self.role.request_leader(session_id, caller)? {
            RequestLeaderOutcome::Assigned(_) => {
                self.broadcast_ordered(
                    session_id,
                    None,
                    Event::LeaderChanged {
                        session_id: session_id.clone(),
                        new_leader_connection_id: caller.clone(),
                        previous_leader_connection_id: None,
                        reason: None,
                    },
                );
            }
            RequestLeaderOutcome::Pending {
                current_leader,
                requester,
            } => {
                self.sink.send_to(
                    &current_leader,
                    Event::LeaderHandoffRequest {
                        session_id: session_id.clone(),
                        requester_connection_id: caller.clone(),
                        requester_info: requester,
                    },
                );
                self.sink.send_to(
                    caller,
                    Event::LeaderRequestSent {
                        session_id: session_id.clone(),
                        message: "leader request sent".to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn handle_approve(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
        requester: &ConnectionId,
    ) -> Result<(), CoordinatorError> {
        let approved = self.role.approve_leader_request(session_id, caller, requester)?;
        self.transport.stop_tick_loop(session_id);

        self.sink.send_to(
            requester,
            Event::LeaderRequestApproved {
                session_id: session_id.clone(),
                message: "leader request approved".to_string(),
            },
        );
        for other in &approved.superseded {
            self.sink.send_to(
                other,
                Event::LeaderRequestDenied {
                    session_id: session_id.clone(),
                    reason: "superseded".to_string(),
                },
            );
        }
        self.broadcast_ordered(
            session_id,
            None,
            Event::LeaderChanged {
                session_id: session_id.clone(),
                new_leader_connection_id: requester.clone(),
                previous_leader_connection_id: Some(approved.previous_leader),
                reason: Some("approved".to_string()),
            },
        );
        Ok(())
    }

    fn handle_deny(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
        requester: &ConnectionId,
    ) -> Result<(), CoordinatorError> {
        self.role.deny_leader_request(session_id, caller, requester)?;
        self.sink.send_to(
            requester,
            Event::LeaderRequestDenied {
                session_id: session_id.clone(),
                reason: "denied".to_string(),
            },
        );
        Ok(())
    }

    fn handle_transport(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
        op: TransportOp,
    ) -> Result<(), CoordinatorError> {
        // Role authorization already ran in `handle_command` before the
        // rate limiter and this dispatch step; `transport`'s own
        // `require_leader` checks are the last line of defense against a
        // stale `session` read, not a repeat of the pipeline step.
        let session = self.registry.get_session(session_id)?;

        let playing_state_changes = matches!(
            op,
            TransportOp::Play | TransportOp::Pause | TransportOp::Stop
        );
        let updated = match op {
            TransportOp::Play => self.transport.play(&session, caller)?,
            TransportOp::Pause => self.transport.pause(&session, caller)?,
            TransportOp::Stop => self.transport.stop(&session, caller)?,
            TransportOp::Seek(position_ms) => self.transport.seek(&session, caller, position_ms)?,
            TransportOp::SetTempo(tempo_bpm) => {
                self.transport.set_tempo(&session, caller, tempo_bpm)?
            }
        };

        let members = self.registry.list_members(session_id)?;
        if playing_state_changes {
            self.broadcast_room_stats(session_id, &updated, members.len() as u32);
        }
        self.broadcast_ordered(
            session_id,
            None,
            Event::Snapshot {
                session: Box::new(updated),
                members,
                server_timestamp: tempolink_types::now_ms(),
            },
        );
        Ok(())
    }

    fn handle_update_message(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
        message: String,
    ) -> Result<(), CoordinatorError> {
        // Member-only, not leader-only: any current member may post a
        // status message.
        self.registry.get_member(session_id, caller)?;
        let patch = SessionPatch {
            message: Some(message),
            ..Default::default()
        };
        let updated = self
            .store_manager
            .update_session(session_id, &patch)?
            .ok_or(CoordinatorError::NotFound(crate::error::NotFoundKind::Session))?;
        let members = self.registry.list_members(session_id)?;
        self.broadcast_ordered(
            session_id,
            None,
            Event::Snapshot {
                session: Box::new(updated),
                members,
                server_timestamp: tempolink_types::now_ms(),
            },
        );
        Ok(())
    }

    fn handle_sync_request(
        &self,
        session_id: &SessionId,
        caller: &ConnectionId,
        reported_position_ms: Option<u64>,
        client_timestamp: Option<u64>,
    ) -> Result<(), CoordinatorError> {
        let session = self.registry.get_session(session_id)?;
        let server_timestamp = tempolink_types::now_ms();

        self.sink.send_to(
            caller,
            Event::SyncResponse {
                session_id: session_id.clone(),
                position_ms: session.position_ms,
                tempo_bpm: session.tempo_bpm,
                is_playing: session.is_playing,
                server_timestamp,
            },
        );

        if let (Some(reported), Some(client_ts)) = (reported_position_ms, client_timestamp) {
            if let Some(correction) = self.sync.check_drift(
                caller,
                session.position_ms,
                reported,
                client_ts,
                session.is_playing,
            ) {
                self.sink.send_to(
                    caller,
                    Event::PositionCorrection {
                        session_id: session_id.clone(),
                        correct_position_ms: correction.correct_position_ms,
                        reported_position_ms: reported,
                        drift_ms: correction.drift_ms,
                        server_timestamp,
                    },
                );
            }
        }
        Ok(())
    }

    /// Broadcasts to every member of a session except `exclude` (if any),
    /// ordered ascending by measured latency so lower-latency members see
    /// state changes sooner. Also re-publishes the event on the session's
    /// pub/sub channel so peer processes' local members see it too.
    fn broadcast_ordered(&self, session_id: &SessionId, exclude: Option<&ConnectionId>, event: Event) {
        let Ok(members) = self.registry.list_members(session_id) else {
            return;
        };
        let ordered = self.sync.order_by_latency(members);
        for member in ordered {
            if Some(&member.connection_id) == exclude {
                continue;
            }
            self.sink.send_to(&member.connection_id, event.clone());
        }
        self.publish_remote(session_id, &event);
    }

    /// Publishes `event` on `session_id`'s pub/sub channel, prefixed with
    /// this instance's id so peer instances' handlers (and this instance's
    /// own, should the active backend ever loop a publish back) can tell
    /// apart a self-origin message from a genuine remote one.
    fn publish_remote(&self, session_id: &SessionId, event: &Event) {
        let Ok(value) = serde_json::to_value(event) else {
            return;
        };
        let event_name = value
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("event")
            .to_string();
        let Ok(payload) = serde_json::to_vec(&value) else {
            return;
        };
        let mut framed = Vec::with_capacity(self.instance_id.len() + 1 + payload.len());
        framed.extend_from_slice(self.instance_id.as_bytes());
        framed.push(b':');
        framed.extend_from_slice(&payload);
        if let Err(e) = self
            .store_manager
            .publish_to_session(session_id, &event_name, &framed)
        {
            log::debug!(target: "coordinator", "publish_to_session({session_id}, {event_name}) failed: {e}");
        }
    }

    /// Subscribes this process to `session_id`'s pub/sub channel the first
    /// time a local member joins it. Idempotent: a session already
    /// subscribed to is left alone.
    fn ensure_subscribed(&self, session_id: &SessionId) {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(session_id) {
            return;
        }

        let sink = self.sink.clone();
        let store = self.store_manager.clone();
        let instance_id = self.instance_id.clone();
        let handler_session_id = session_id.clone();
        let handler: PubSubHandler = Arc::new(move |message: Vec<u8>| {
            let Some(sep) = message.iter().position(|&b| b == b':') else {
                return;
            };
            let (origin, rest) = message.split_at(sep);
            if origin == instance_id.as_bytes() {
                return;
            }
            let Ok(event) = serde_json::from_slice::<Event>(&rest[1..]) else {
                return;
            };
            let Ok(members) = store.list_members(&handler_session_id) else {
                return;
            };
            for member in members {
                sink.send_to(&member.connection_id, event.clone());
            }
        });

        match self.store_manager.subscribe_to_session(session_id, handler) {
            Ok(handle) => {
                subscriptions.insert(session_id.clone(), handle);
            }
            Err(e) => {
                log::debug!(target: "coordinator", "subscribe_to_session({session_id}) failed: {e}");
            }
        }
    }

    /// Drops the local pub/sub subscription for a session once it has no
    /// members left locally-visible (the global membership list is empty,
    /// since all instances share the same store) — the idle sweep will
    /// delete the session itself shortly after.
    fn maybe_unsubscribe(&self, session_id: &SessionId) {
        self.subscriptions.lock().remove(session_id);
    }

    /// Broadcasts a `roomStats` snapshot alongside membership/transport
    /// changes — a lighter-weight summary than `snapshot` for clients that
    /// only render a member-count/leader/playing indicator.
    fn broadcast_room_stats(&self, session_id: &SessionId, session: &tempolink_types::Session, member_count: u32) {
        self.broadcast_ordered(
            session_id,
            None,
            Event::RoomStats {
                session_id: session_id.clone(),
                member_count,
                is_playing: session.is_playing,
                leader: session.leader_connection_id.clone(),
            },
        );
    }

    fn emit_error(&self, caller: &ConnectionId, error: CoordinatorError) {
        self.sink.send_to(caller, crate::error::to_event(&error));
    }
}

enum TransportOp {
    Play,
    Pause,
    Stop,
    Seek(u64),
    SetTempo(u16),
}

fn fan_out_tick(
    store: &Arc<dyn Store>,
    sync: &Arc<SyncEngine>,
    sink: &dyn EventSink,
    session_id: &SessionId,
    position_ms: u64,
    tempo_bpm: u16,
    server_timestamp: u64,
) {
    let Ok(members) = store.list_members(session_id) else {
        return;
    };
    let ordered = sync.order_by_latency(members);
    let event = Event::ScrollTick {
        session_id: session_id.clone(),
        position_ms,
        tempo_bpm,
        server_timestamp,
    };
    for member in ordered {
        sink.send_to(&member.connection_id, event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempolink_types::ErrorCode;

    struct RecordingSink {
        events: Mutex<Vec<(ConnectionId, Event)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events_for(&self, connection_id: &ConnectionId) -> Vec<Event> {
            self.events
                .lock()
                .iter()
                .filter(|(cid, _)| cid == connection_id)
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn send_to(&self, connection_id: &ConnectionId, event: Event) {
            self.events.lock().push((connection_id.clone(), event));
        }

        fn disconnect(&self, _connection_id: &ConnectionId) {}
    }

    fn test_coordinator() -> (Arc<Coordinator>, Arc<RecordingSink>) {
        std::env::set_var("TEMPOLINK_HEALTH_PORT", "0");
        std::env::set_var("TEMPOLINK_STORE_BACKEND", "memory");
        std::env::set_var("TEMPOLINK_TELEMETRY_REPORT_INTERVAL_SECS", "1");
        let config = Config::load();
        std::env::remove_var("TEMPOLINK_HEALTH_PORT");
        std::env::remove_var("TEMPOLINK_STORE_BACKEND");
        std::env::remove_var("TEMPOLINK_TELEMETRY_REPORT_INTERVAL_SECS");
        let sink = RecordingSink::new();
        let coordinator = Coordinator::new(&config, sink.clone() as Arc<dyn EventSink>);
        (coordinator, sink)
    }

    #[test]
    fn latency_probe_with_session_id_refreshes_member_liveness_fields() {
        let (coordinator, _sink) = test_coordinator();
        let session_id = SessionId::from("s1");
        let caller = ConnectionId::from("c1".to_string());
        coordinator.handle_command(
            &caller,
            Command::JoinSession {
                session_id: session_id.clone(),
                display_name: Some("alice".to_string()),
                role: None,
            },
        );
        let before = coordinator.registry.get_member(&session_id, &caller).unwrap();
        assert!(before.measured_latency_ms.is_none());

        coordinator.handle_command(
            &caller,
            Command::LatencyProbe {
                session_id: Some(session_id.clone()),
                client_timestamp: tempolink_types::now_ms(),
            },
        );

        let after = coordinator.registry.get_member(&session_id, &caller).unwrap();
        assert!(after.measured_latency_ms.is_some());
        assert!(after.last_ping_at >= before.last_ping_at);
    }

    #[test]
    fn session_less_latency_probe_does_not_touch_any_member() {
        let (coordinator, sink) = test_coordinator();
        let caller = ConnectionId::from("c1".to_string());
        coordinator.handle_command(
            &caller,
            Command::LatencyProbe {
                session_id: None,
                client_timestamp: tempolink_types::now_ms(),
            },
        );
        let responses = sink.events_for(&caller);
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], Event::LatencyResponse { .. }));
    }

    #[test]
    fn unauthorized_leader_only_command_is_never_masked_by_rate_limiting() {
        let (coordinator, sink) = test_coordinator();
        let session_id = SessionId::from("s1");
        let leader = ConnectionId::from("leader".to_string());
        let follower = ConnectionId::from("follower".to_string());
        coordinator.handle_command(
            &leader,
            Command::JoinSession {
                session_id: session_id.clone(),
                display_name: None,
                role: None,
            },
        );
        coordinator.handle_command(
            &follower,
            Command::JoinSession {
                session_id: session_id.clone(),
                display_name: None,
                role: None,
            },
        );

        // "play"'s burst capacity is 5 — ten attempts would flip to
        // `RateLimitExceeded` under the old (rate-limit-before-authorize)
        // ordering once the bucket ran dry.
        for _ in 0..10 {
            coordinator.handle_command(
                &follower,
                Command::Play {
                    session_id: session_id.clone(),
                },
            );
        }

        let errors: Vec<ErrorCode> = sink
            .events_for(&follower)
            .into_iter()
            .filter_map(|e| match e {
                Event::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 10);
        assert!(errors.iter().all(|c| *c == ErrorCode::InsufficientRole));
    }

    #[test]
    fn departing_non_leader_loses_its_own_pending_leader_request() {
        let (coordinator, _sink) = test_coordinator();
        let session_id = SessionId::from("s1");
        let leader = ConnectionId::from("leader".to_string());
        let requester = ConnectionId::from("requester".to_string());
        coordinator.handle_command(
            &leader,
            Command::JoinSession {
                session_id: session_id.clone(),
                display_name: None,
                role: None,
            },
        );
        coordinator.handle_command(
            &requester,
            Command::JoinSession {
                session_id: session_id.clone(),
                display_name: None,
                role: None,
            },
        );
        coordinator.handle_command(
            &requester,
            Command::RequestLeader {
                session_id: session_id.clone(),
            },
        );

        coordinator.handle_disconnect(&requester);

        let err = coordinator
            .handle_approve(&session_id, &leader, &requester)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict));
    }
}
