//! The wire/command vocabulary exchanged between a connection and the
//! coordinator. `Command` is inbound (client to server), `Event` is outbound
//! (server to client); both are plain serde enums so `tempolink-net` can
//! frame them directly with no intermediate translation layer, following
//! the teacher's `ClientMessage`/`ServerMessage` pair in shape (see
//! `imbolc-net/src/protocol.rs`).
//!
//! On the wire each message is `{ "name": <variant>, "payload": {..} }`,
//! realized here as serde's adjacently-tagged representation.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, SessionId};
use crate::member::Member;
use crate::session::{Role, Session};

/// Inbound messages, one variant per client-to-server command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: SessionId,
        display_name: Option<String>,
        role: Option<Role>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveSession { session_id: SessionId },
    /// Sugar: `role: Leader` is shorthand for `RequestLeader`, never an
    /// implicit takeover.
    #[serde(rename_all = "camelCase")]
    SetRole { session_id: SessionId, role: Role },
    #[serde(rename_all = "camelCase")]
    RequestLeader { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    ApproveLeaderRequest {
        session_id: SessionId,
        requester_connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    DenyLeaderRequest {
        session_id: SessionId,
        requester_connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    Play { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Pause { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Stop { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Seek {
        session_id: SessionId,
        position_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    SetTempo {
        session_id: SessionId,
        tempo_bpm: u16,
    },
    #[serde(rename_all = "camelCase")]
    UpdateMessage {
        session_id: SessionId,
        message: String,
    },
    /// `reported_position_ms`/`client_timestamp` are optional: a bare sync
    /// poll omits them, while a drift-correction report carries both so the
    /// coordinator can compare the client's position against its own.
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        session_id: SessionId,
        #[serde(default)]
        reported_position_ms: Option<u64>,
        #[serde(default)]
        client_timestamp: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    LatencyProbe {
        session_id: Option<SessionId>,
        client_timestamp: u64,
    },
}

impl Command {
    /// The session this command is scoped to, if any (`latencyProbe` may be
    /// session-less).
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Command::JoinSession { session_id, .. }
            | Command::LeaveSession { session_id }
            | Command::SetRole { session_id, .. }
            | Command::RequestLeader { session_id }
            | Command::ApproveLeaderRequest { session_id, .. }
            | Command::DenyLeaderRequest { session_id, .. }
            | Command::Play { session_id }
            | Command::Pause { session_id }
            | Command::Stop { session_id }
            | Command::Seek { session_id, .. }
            | Command::SetTempo { session_id, .. }
            | Command::UpdateMessage { session_id, .. }
            | Command::SyncRequest { session_id, .. } => Some(session_id),
            Command::LatencyProbe { session_id, .. } => session_id.as_ref(),
        }
    }

    /// Whether this command may only be issued by the session's current
    /// leader.
    pub fn is_leader_only(&self) -> bool {
        matches!(
            self,
            Command::Play { .. }
                | Command::Pause { .. }
                | Command::Stop { .. }
                | Command::Seek { .. }
                | Command::SetTempo { .. }
        )
    }

    /// A short, stable name used as the rate-limit bucket key.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::JoinSession { .. } => "joinSession",
            Command::LeaveSession { .. } => "leaveSession",
            Command::SetRole { .. } => "setRole",
            Command::RequestLeader { .. } => "requestLeader",
            Command::ApproveLeaderRequest { .. } => "approveLeaderRequest",
            Command::DenyLeaderRequest { .. } => "denyLeaderRequest",
            Command::Play { .. } => "play",
            Command::Pause { .. } => "pause",
            Command::Stop { .. } => "stop",
            Command::Seek { .. } => "seek",
            Command::SetTempo { .. } => "setTempo",
            Command::UpdateMessage { .. } => "updateMessage",
            Command::SyncRequest { .. } => "syncRequest",
            Command::LatencyProbe { .. } => "latencyProbe",
        }
    }
}

/// The coordinator's error taxonomy, exposed verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    SessionNotFound,
    SessionFull,
    MemberNotFound,
    InsufficientRole,
    NoPendingRequest,
    RateLimitExceeded,
    Internal,
}

/// Outbound messages, one variant per server-to-client event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Snapshot {
        #[serde(flatten)]
        session: Box<Session>,
        members: Vec<Member>,
        server_timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    RoomStats {
        session_id: SessionId,
        member_count: u32,
        is_playing: bool,
        leader: Option<ConnectionId>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined { member: Member, member_count: u32 },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        connection_id: ConnectionId,
        member_count: u32,
        new_leader: Option<ConnectionId>,
    },
    #[serde(rename_all = "camelCase")]
    LeaderChanged {
        session_id: SessionId,
        new_leader_connection_id: ConnectionId,
        previous_leader_connection_id: Option<ConnectionId>,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    LeaderAutoAssigned {
        session_id: SessionId,
        new_leader_connection_id: ConnectionId,
        previous_leader_connection_id: Option<ConnectionId>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaderHandoffRequest {
        session_id: SessionId,
        requester_connection_id: ConnectionId,
        requester_info: Member,
    },
    #[serde(rename_all = "camelCase")]
    LeaderRequestSent {
        session_id: SessionId,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaderRequestApproved {
        session_id: SessionId,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaderRequestDenied {
        session_id: SessionId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ScrollTick {
        session_id: SessionId,
        position_ms: u64,
        tempo_bpm: u16,
        server_timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    SyncResponse {
        session_id: SessionId,
        position_ms: u64,
        tempo_bpm: u16,
        is_playing: bool,
        server_timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    LatencyResponse {
        client_timestamp: u64,
        server_timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    PositionCorrection {
        session_id: SessionId,
        correct_position_ms: u64,
        reported_position_ms: u64,
        drift_ms: i64,
        server_timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        code: ErrorCode,
        required_role: Option<Role>,
        current_role: Option<Role>,
        current_leader: Option<ConnectionId>,
        retry_after: Option<u64>,
    },
}

impl Event {
    /// Whether this event must be delivered reliably: every authoritative
    /// state event except the best-effort `scrollTick` path.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Event::ScrollTick { .. })
    }
}
