//! Redis-backed durable `Store`. Realizes the persisted-state layout of
//! literally:
//!
//! - `session:{sessionId}` → JSON-serialized `Session`.
//! - `session:{sessionId}:members` → hash of `connectionId` → JSON `Member`.
//! - `session:{sessionId}:leader_requests` → hash of `connectionId` → JSON
//! `LeaderRequest`.
//! - `connection:{connectionId}:session` → `sessionId` string.
//!
//! Every key above carries a TTL equal to the session idle TTL, refreshed on
//! mutation, per §6.
//!
//! No full example repo in the retrieval pack uses `redis`; it is grounded
//! on `examples/other_examples/manifests/harborgrid-justin-caddy/Cargo.toml`,
//! the closest durable-KV-backed service manifest available (see
//! `DESIGN.md`). Connection pooling uses the `redis` crate's own `r2d2`
//! integration feature rather than a hand-rolled pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use r2d2::Pool;
use redis::{Commands, RedisError};

use tempolink_types::session::SessionPatch;
use tempolink_types::{ConnectionId, LeaderRequest, Member, Session, SessionId};

use crate::error::StoreError;
use crate::traits::{BackendKind, PubSubHandler, Store, SubscriptionHandle};

fn session_key(id: &SessionId) -> String {
    format!("session:{}", id.as_str())
}
fn members_key(id: &SessionId) -> String {
    format!("session:{}:members", id.as_str())
}
fn leader_requests_key(id: &SessionId) -> String {
    format!("session:{}:leader_requests", id.as_str())
}
fn connection_key(id: &ConnectionId) -> String {
    format!("connection:{}:session", id.as_str())
}
fn channel_name(id: &SessionId) -> String {
    format!("tempolink:session:{}", id.as_str())
}

fn map_redis_err(e: RedisError) -> StoreError {
    if e.is_connection_dropped() || e.is_timeout() || e.is_io_error() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

pub struct DurableStore {
    pool: Pool<redis::Client>,
    redis_url: String,
    ttl_secs: u64,
}

impl DurableStore {
    pub fn connect(redis_url: &str, ttl_secs: u64) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let pool = Pool::builder()
            .max_size(16)
            .connection_timeout(Duration::from_secs(5))
            .build(client)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self {
            pool,
            redis_url: redis_url.to_string(),
            ttl_secs,
        };
        if !store.health_check() {
            return Err(StoreError::Unavailable(format!(
                "could not reach redis at {redis_url}"
            )));
        }
        Ok(store)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<redis::Client>, StoreError> {
        self.pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn refresh_ttl(&self, conn: &mut redis::Connection, key: &str) -> Result<(), StoreError> {
        let _: () = conn.expire(key, self.ttl_secs as i64).map_err(map_redis_err)?;
        Ok(())
    }
}

impl Store for DurableStore {
    fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        let mut conn = self.conn()?;
        let key = session_key(&session.session_id);
        let exists: bool = conn.exists(&key).map_err(map_redis_err)?;
        if exists {
            return Err(StoreError::AlreadyExists);
        }
        let json = serde_json::to_string(&session)?;
        let _: () = conn
            .set_ex(&key, json, self.ttl_secs)
            .map_err(map_redis_err)?;
        Ok(session)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.get(session_key(session_id)).map_err(map_redis_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn update_session(
        &self,
        session_id: &SessionId,
        patch: &SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.get_session(session_id)? else {
            return Ok(None);
        };
        patch.apply(&mut session);
        let mut conn = self.conn()?;
        let json = serde_json::to_string(&session)?;
        let _: () = conn
            .set_ex(session_key(session_id), json, self.ttl_secs)
            .map_err(map_redis_err)?;
        Ok(Some(session))
    }

    fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn
            .del(session_key(session_id))
            .map_err(map_redis_err)?;
        let _: i64 = conn.del(members_key(session_id)).map_err(map_redis_err)?;
        let _: i64 = conn
            .del(leader_requests_key(session_id))
            .map_err(map_redis_err)?;
        Ok(removed > 0)
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.conn()?;
        let mut sessions = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("session:*")
                .arg("COUNT")
                .arg(200)
                .query(&mut *conn)
                .map_err(map_redis_err)?;
            for key in keys {
                if key.ends_with(":members") || key.ends_with(":leader_requests") {
                    continue;
                }
                let raw: Option<String> = conn.get(&key).map_err(map_redis_err)?;
                if let Some(json) = raw {
                    sessions.push(serde_json::from_str(&json)?);
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(sessions)
    }

    fn add_member(&self, member: Member) -> Result<Member, StoreError> {
        let mut conn = self.conn()?;
        let key = members_key(&member.session_id);
        let json = serde_json::to_string(&member)?;
        let _: () = conn
            .hset(&key, member.connection_id.as_str(), json)
            .map_err(map_redis_err)?;
        self.refresh_ttl(&mut conn, &key)?;
        Ok(member)
    }

    fn remove_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<Member>, StoreError> {
        let existing = self.get_member(session_id, connection_id)?;
        if existing.is_some() {
            let mut conn = self.conn()?;
            let _: () = conn
                .hdel(members_key(session_id), connection_id.as_str())
                .map_err(map_redis_err)?;
        }
        Ok(existing)
    }

    fn update_member(&self, member: Member) -> Result<Member, StoreError> {
        self.add_member(member)
    }

    fn get_member(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<Member>, StoreError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn
            .hget(members_key(session_id), connection_id.as_str())
            .map_err(map_redis_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_members(&self, session_id: &SessionId) -> Result<Vec<Member>, StoreError> {
        let mut conn = self.conn()?;
        let values: Vec<String> = conn
            .hvals(members_key(session_id))
            .map_err(map_redis_err)?;
        values
            .into_iter()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    fn member_count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let count: usize = conn.hlen(members_key(session_id)).map_err(map_redis_err)?;
        Ok(count)
    }

    fn set_session_by_connection(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: () = conn
            .set_ex(connection_key(connection_id), session_id.as_str(), self.ttl_secs)
            .map_err(map_redis_err)?;
        Ok(())
    }

    fn get_session_by_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<SessionId>, StoreError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn
            .get(connection_key(connection_id))
            .map_err(map_redis_err)?;
        Ok(raw.map(SessionId::from))
    }

    fn remove_connection_index(&self, connection_id: &ConnectionId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: i64 = conn.del(connection_key(connection_id)).map_err(map_redis_err)?;
        Ok(())
    }

    fn add_leader_request(&self, request: LeaderRequest) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let key = leader_requests_key(&request.session_id);
        let json = serde_json::to_string(&request)?;
        let _: () = conn
            .hset(&key, request.connection_id.as_str(), json)
            .map_err(map_redis_err)?;
        self.refresh_ttl(&mut conn, &key)?;
        Ok(())
    }

    fn remove_leader_request(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<Option<LeaderRequest>, StoreError> {
        let mut conn = self.conn()?;
        let key = leader_requests_key(session_id);
        let raw: Option<String> = conn.hget(&key, connection_id.as_str()).map_err(map_redis_err)?;
        if raw.is_some() {
            let _: () = conn.hdel(&key, connection_id.as_str()).map_err(map_redis_err)?;
        }
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError> {
        let mut conn = self.conn()?;
        let values: Vec<String> = conn
            .hvals(leader_requests_key(session_id))
            .map_err(map_redis_err)?;
        let mut requests: Vec<LeaderRequest> = values
            .into_iter()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect::<Result<_, _>>()?;
        requests.sort_by_key(|r| r.requested_at);
        Ok(requests)
    }

    fn clear_leader_requests(&self, session_id: &SessionId) -> Result<Vec<LeaderRequest>, StoreError> {
        let requests = self.list_leader_requests(session_id)?;
        if !requests.is_empty() {
            let mut conn = self.conn()?;
            let _: i64 = conn
                .del(leader_requests_key(session_id))
                .map_err(map_redis_err)?;
        }
        Ok(requests)
    }

    fn publish_to_session(
        &self,
        session_id: &SessionId,
        event_name: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let mut message = Vec::with_capacity(event_name.len() + 1 + payload.len());
        message.extend_from_slice(event_name.as_bytes());
        message.push(b':');
        message.extend_from_slice(payload);
        let _: i64 = conn
            .publish(channel_name(session_id), message)
            .map_err(map_redis_err)?;
        Ok(())
    }

    fn subscribe_to_session(
        &self,
        session_id: &SessionId,
        handler: PubSubHandler,
    ) -> Result<SubscriptionHandle, StoreError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let channel = channel_name(session_id);
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let handle = thread::Builder::new()
            .name(format!("tempolink-pubsub-{}", session_id.as_str()))
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!(target: "store", "pubsub connection failed: {e}");
                        return;
                    }
                };
                let mut pubsub = conn.as_pubsub();
                if let Err(e) = pubsub.subscribe(&channel) {
                    log::warn!(target: "store", "pubsub subscribe failed: {e}");
                    return;
                }
                if let Err(e) = pubsub.set_read_timeout(Some(Duration::from_millis(500))) {
                    log::warn!(target: "store", "pubsub set_read_timeout failed: {e}");
                }
                while !stop_clone.load(Ordering::SeqCst) {
                    match pubsub.get_message() {
                        Ok(msg) => {
                            if let Ok(payload) = msg.get_payload::<Vec<u8>>() {
                                handler(payload);
                            }
                        }
                        Err(e) if e.is_timeout() => continue,
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(SubscriptionHandle::new(stop, handle))
    }

    fn health_check(&self) -> bool {
        match self.conn() {
            Ok(mut conn) => redis::cmd("PING").query::<String>(&mut *conn).is_ok(),
            Err(_) => false,
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Durable
    }
}
