//! A single connection's membership in a session.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, SessionId};
use crate::session::Role;
use crate::time::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: u64,
    pub last_ping_at: u64,
    pub measured_latency_ms: Option<u32>,
}

impl Member {
    pub fn new(session_id: SessionId, connection_id: ConnectionId, display_name: String) -> Self {
        let now = now_ms();
        Self {
            session_id,
            connection_id,
            display_name,
            role: Role::Follower,
            joined_at: now,
            last_ping_at: now,
            measured_latency_ms: None,
        }
    }
}
