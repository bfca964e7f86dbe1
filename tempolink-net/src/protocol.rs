//! The one piece of wire vocabulary that sits below `tempolink_types::Command`/
//! `Event`: telling a freshly-accepted connection its own assigned id.
//!
//! The connection identifier is server-assigned on accept, and there is no
//! client-chosen identifier to echo back, unlike the teacher's
//! `Hello{client_name, ...}` / `Welcome{client_id, ...}` handshake. Resolved
//! here (see `DESIGN.md`) by sending this single-field envelope as the
//! first frame on every accepted connection, before any `Command`/`Event`
//! traffic begins.

use serde::{Deserialize, Serialize};

use tempolink_types::ConnectionId;

/// First frame sent server to client on every new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionWelcome {
    pub connection_id: ConnectionId,
}
