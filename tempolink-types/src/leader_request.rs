//! A pending request to take over session leadership.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, SessionId};
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderRequestStatus {
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderRequest {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub requested_at: u64,
    pub status: LeaderRequestStatus,
}

impl LeaderRequest {
    pub fn new(session_id: SessionId, connection_id: ConnectionId) -> Self {
        Self {
            session_id,
            connection_id,
            requested_at: now_ms(),
            status: LeaderRequestStatus::Pending,
        }
    }
}
