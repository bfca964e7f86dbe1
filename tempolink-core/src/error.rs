//! The coordinator's error taxonomy.
//!
//! Every fallible operation in `registry`, `role`, `transport`, and
//! `dispatch` returns `Result<_, CoordinatorError>`. The dispatcher is the
//! only place that turns one of these into a wire `error` event; nothing
//! else in this crate touches `tempolink_net`.

use tempolink_types::{ConnectionId, ErrorCode, Event};

/// Which kind of lookup missed, so the wire mapping can pick between
/// `SESSION_NOT_FOUND` and `MEMBER_NOT_FOUND` even though both collapse to
/// one error kind internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Session,
    Member,
}

/// Errors surfaced to a connection as the wire `error` event's `code`, or
/// escalated to `StoreManager` when they originate from the backend.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("{0}")]
    Validation(String),

    #[error("session or member not found")]
    NotFound(NotFoundKind),

    #[error("session is full")]
    Capacity,

    /// Caller attempted a leader-only operation without holding leadership.
    #[error("insufficient role")]
    Authorization {
        current_leader: Option<ConnectionId>,
    },

    #[error("rate limit exceeded")]
    RateLimited { retry_after_ms: u64 },

    /// No pending leader request, or an attempt to create what already exists.
    #[error("conflicting state")]
    Conflict,

    /// The store reported a failure (including "connection lost").
    #[error("backend unavailable")]
    Backend,

    #[error("internal error")]
    Internal,
}

impl From<tempolink_store::StoreError> for CoordinatorError {
    fn from(e: tempolink_store::StoreError) -> Self {
        log::error!(target: "dispatch", "store operation failed: {e}");
        CoordinatorError::Backend
    }
}

/// Builds the wire `error` event for a `CoordinatorError`. `NotFound`'s two
/// kinds and `Conflict` both collapse onto wire-level codes that carry less
/// detail than the Rust-level taxonomy, since the client only needs to know
/// what to do next, not exactly which internal invariant tripped.
pub fn to_event(error: &CoordinatorError) -> Event {
    let (code, current_leader, retry_after) = match error {
        CoordinatorError::Validation(_) => (ErrorCode::ValidationError, None, None),
        CoordinatorError::NotFound(NotFoundKind::Session) => {
            (ErrorCode::SessionNotFound, None, None)
        }
        CoordinatorError::NotFound(NotFoundKind::Member) => (ErrorCode::MemberNotFound, None, None),
        CoordinatorError::Capacity => (ErrorCode::SessionFull, None, None),
        CoordinatorError::Authorization { current_leader } => {
            (ErrorCode::InsufficientRole, current_leader.clone(), None)
        }
        CoordinatorError::RateLimited { retry_after_ms } => {
            (ErrorCode::RateLimitExceeded, None, Some(*retry_after_ms))
        }
        CoordinatorError::Conflict => (ErrorCode::NoPendingRequest, None, None),
        CoordinatorError::Backend | CoordinatorError::Internal => (ErrorCode::Internal, None, None),
    };

    Event::Error {
        message: error.to_string(),
        code,
        required_role: None,
        current_role: None,
        current_leader,
        retry_after,
    }
}
