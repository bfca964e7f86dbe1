//! The pipeline steps that do not already belong to
//! a more specific module: payload validation, leader-only authorization,
//! and rate limiting. Session/role/transport mutation itself lives in
//! `registry`/`role`/`transport`; `coordinator` is the only caller of this
//! module, and it runs these checks in order before touching any of them.

use tempolink_types::session::{is_valid_tempo, MAX_MESSAGE_LEN};
use tempolink_types::{Command, ConnectionId, Session};

use crate::error::CoordinatorError;
use crate::ratelimit::{RateLimitDecision, RateLimiter};

pub struct EventDispatcher {
    rate_limiter: RateLimiter,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            rate_limiter: RateLimiter::new(),
        }
    }

    /// Payload shape and value-range checks that do not depend on session
    /// state.
    pub fn validate(&self, command: &Command) -> Result<(), CoordinatorError> {
        match command {
            Command::SetTempo { tempo_bpm, .. } if !is_valid_tempo(*tempo_bpm) => Err(
                CoordinatorError::Validation(format!("tempoBpm {tempo_bpm} out of range")),
            ),
            Command::UpdateMessage { message, .. } if message.len() > MAX_MESSAGE_LEN => {
                Err(CoordinatorError::Validation(format!(
                    "message exceeds {MAX_MESSAGE_LEN} bytes"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Leader-only commands require the caller to currently hold
    /// leadership of the session they are scoped to.
    pub fn authorize(&self, command: &Command, session: &Session, caller: &ConnectionId) -> Result<(), CoordinatorError> {
        if command.is_leader_only() && session.leader_connection_id.as_ref() != Some(caller) {
            return Err(CoordinatorError::Authorization {
                current_leader: session.leader_connection_id.clone(),
            });
        }
        Ok(())
    }

    /// Per-connection, per-command-kind token bucket.
    pub fn check_rate_limit(&self, connection_id: &ConnectionId, command: &Command) -> Result<(), CoordinatorError> {
        match self.rate_limiter.check(connection_id, command.kind()) {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited { retry_after_ms } => {
                Err(CoordinatorError::RateLimited { retry_after_ms })
            }
        }
    }

    pub fn should_disconnect(&self, connection_id: &ConnectionId) -> bool {
        self.rate_limiter.is_persistent_violator(connection_id)
    }

    pub fn forget_connection(&self, connection_id: &ConnectionId) {
        self.rate_limiter.remove_connection(connection_id);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempolink_types::{ConnectionId, Role, SessionId};

    fn command(session_id: &str) -> Command {
        Command::Play {
            session_id: SessionId::from(session_id),
        }
    }

    #[test]
    fn validate_rejects_out_of_range_tempo() {
        let dispatcher = EventDispatcher::new();
        let cmd = Command::SetTempo {
            session_id: SessionId::from("s1"),
            tempo_bpm: 999,
        };
        assert!(matches!(
            dispatcher.validate(&cmd),
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_oversized_message() {
        let dispatcher = EventDispatcher::new();
        let cmd = Command::UpdateMessage {
            session_id: SessionId::from("s1"),
            message: "x".repeat(MAX_MESSAGE_LEN + 1),
        };
        assert!(matches!(
            dispatcher.validate(&cmd),
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[test]
    fn authorize_rejects_non_leader_on_leader_only_commands() {
        let dispatcher = EventDispatcher::new();
        let mut session = tempolink_types::Session::new(SessionId::from("s1"));
        session.leader_connection_id = Some(ConnectionId::from("leader".to_string()));
        let caller = ConnectionId::from("someone-else".to_string());
        let err = dispatcher
            .authorize(&command("s1"), &session, &caller)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Authorization { .. }));
    }

    #[test]
    fn authorize_allows_member_only_commands_for_anyone() {
        let dispatcher = EventDispatcher::new();
        let session = tempolink_types::Session::new(SessionId::from("s1"));
        let caller = ConnectionId::from("anyone".to_string());
        let cmd = Command::SetRole {
            session_id: SessionId::from("s1"),
            role: Role::Follower,
        };
        assert!(dispatcher.authorize(&cmd, &session, &caller).is_ok());
    }
}
