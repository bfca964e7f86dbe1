//! Wall-clock timestamp helper shared by every component that stamps a
//! `Session`, `Member`, or `LeaderRequest`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Used for all `createdAt`/`lastActiveAt`/
/// `joinedAt`/`requestedAt`/`serverTimestamp` fields so the wire format stays
/// a plain integer.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
