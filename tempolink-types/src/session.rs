//! The authoritative transport state of a coordination session.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, SessionId};
use crate::time::now_ms;

/// Lower bound of the valid tempo range, inclusive.
pub const MIN_TEMPO_BPM: u16 = 40;
/// Upper bound of the valid tempo range, inclusive.
pub const MAX_TEMPO_BPM: u16 = 300;
/// Default tempo assigned to a newly-created session.
pub const DEFAULT_TEMPO_BPM: u16 = 120;
/// Default capacity of a newly-created session.
pub const DEFAULT_MAX_MEMBERS: u32 = 8;
/// Maximum length, in bytes, of a session status message.
pub const MAX_MESSAGE_LEN: usize = 500;

/// A member's role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub max_members: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_members: DEFAULT_MAX_MEMBERS,
        }
    }
}

/// Checks whether a tempo value lies in the inclusive valid range.
pub fn is_valid_tempo(bpm: u16) -> bool {
    (MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&bpm)
}

/// The authoritative transport state and metadata for one coordination
/// session. Invariants are enforced by `tempolink-core`'s `registry`/`role`/
/// `transport` modules, not by this struct itself; this is a plain data
/// holder, as a value exchanged with `Store` implementations must be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub message: String,
    pub tempo_bpm: u16,
    pub position_ms: u64,
    pub is_playing: bool,
    pub leader_connection_id: Option<ConnectionId>,
    pub settings: SessionSettings,
    pub created_at: u64,
    pub last_active_at: u64,
}

impl Session {
    /// Construct a session with the mandated default transport state:
    /// `tempoBpm = 120`, `positionMs = 0`, `isPlaying = false`,
    /// `leaderConnectionId = null`.
    pub fn new(session_id: SessionId) -> Self {
        let now = now_ms();
        Self {
            session_id,
            message: String::new(),
            tempo_bpm: DEFAULT_TEMPO_BPM,
            position_ms: 0,
            is_playing: false,
            leader_connection_id: None,
            settings: SessionSettings::default(),
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = now_ms();
    }
}

/// A last-writer-wins, field-level patch applied by `Store::update_session`.
/// `None` means "leave unchanged"; `leader_connection_id` is double-`Option`
/// so a patch can explicitly clear the leader (`Some(None)`) as distinct
/// from not touching it at all (`None`).
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub message: Option<String>,
    pub tempo_bpm: Option<u16>,
    pub position_ms: Option<u64>,
    pub is_playing: Option<bool>,
    pub leader_connection_id: Option<Option<ConnectionId>>,
    pub max_members: Option<u32>,
}

impl SessionPatch {
    pub fn apply(&self, session: &mut Session) {
        if let Some(ref message) = self.message {
            session.message = message.clone();
        }
        if let Some(tempo_bpm) = self.tempo_bpm {
            session.tempo_bpm = tempo_bpm;
        }
        if let Some(position_ms) = self.position_ms {
            session.position_ms = position_ms;
        }
        if let Some(is_playing) = self.is_playing {
            session.is_playing = is_playing;
        }
        if let Some(ref leader) = self.leader_connection_id {
            session.leader_connection_id = leader.clone();
        }
        if let Some(max_members) = self.max_members {
            session.settings.max_members = max_members;
        }
        session.touch();
    }
}
