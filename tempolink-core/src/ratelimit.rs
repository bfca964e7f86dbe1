//! Per-connection, per-command-kind token-bucket rate limiting. Anything
//! not explicitly listed in `bucket_limits` falls back to a generous
//! ambient default rather than being unlimited, since an unbounded command
//! kind is itself a denial-of-service surface.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tempolink_types::ConnectionId;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            capacity: burst,
            tokens: burst,
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }

    fn try_take(&mut self) -> Result<(), u64> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err((deficit / self.refill_per_sec * 1000.0).ceil() as u64)
        }
    }
}

fn bucket_limits(kind: &str) -> (f64, f64) {
    match kind {
        "joinSession" => (2.0, 1.0),
        "setTempo" => (5.0, 2.0),
        "syncRequest" => (50.0, 10.0),
        _ => (10.0, 5.0),
    }
}

pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

/// Connections with more than this many over-limit bursts are considered
/// persistent violators and may be disconnected.
const PERSISTENT_VIOLATION_THRESHOLD: u32 = 10;

pub struct RateLimiter {
    buckets: Mutex<HashMap<(ConnectionId, &'static str), TokenBucket>>,
    violations: Mutex<HashMap<ConnectionId, u32>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            violations: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, connection_id: &ConnectionId, kind: &'static str) -> RateLimitDecision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((connection_id.clone(), kind))
            .or_insert_with(|| {
                let (rate, burst) = bucket_limits(kind);
                TokenBucket::new(rate, burst)
            });

        match bucket.try_take() {
            Ok(()) => RateLimitDecision::Allowed,
            Err(retry_after_ms) => {
                *self
                    .violations
                    .lock()
                    .entry(connection_id.clone())
                    .or_insert(0) += 1;
                RateLimitDecision::Limited { retry_after_ms }
            }
        }
    }

    /// Whether this connection has accumulated enough over-limit bursts to
    /// warrant disconnection.
    pub fn is_persistent_violator(&self, connection_id: &ConnectionId) -> bool {
        self.violations
            .lock()
            .get(connection_id)
            .is_some_and(|count| *count > PERSISTENT_VIOLATION_THRESHOLD)
    }

    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        self.buckets.lock().retain(|(cid, _), _| cid != connection_id);
        self.violations.lock().remove(connection_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_allowed_then_limited() {
        let limiter = RateLimiter::new();
        let cid = ConnectionId::from("c1".to_string());
        for _ in 0..1 {
            assert!(matches!(
                limiter.check(&cid, "joinSession"),
                RateLimitDecision::Allowed
            ));
        }
        // burst for joinSession is 1: the next call should be limited.
        assert!(matches!(
            limiter.check(&cid, "joinSession"),
            RateLimitDecision::Limited { .. }
        ));
    }

    #[test]
    fn different_kinds_have_independent_buckets() {
        let limiter = RateLimiter::new();
        let cid = ConnectionId::from("c1".to_string());
        assert!(matches!(
            limiter.check(&cid, "joinSession"),
            RateLimitDecision::Allowed
        ));
        assert!(matches!(
            limiter.check(&cid, "setTempo"),
            RateLimitDecision::Allowed
        ));
    }

    #[test]
    fn persistent_violator_is_flagged_after_threshold() {
        let limiter = RateLimiter::new();
        let cid = ConnectionId::from("c1".to_string());
        for _ in 0..(PERSISTENT_VIOLATION_THRESHOLD + 5) {
            limiter.check(&cid, "joinSession");
        }
        assert!(limiter.is_persistent_violator(&cid));
    }

    #[test]
    fn removing_a_connection_clears_its_state() {
        let limiter = RateLimiter::new();
        let cid = ConnectionId::from("c1".to_string());
        limiter.check(&cid, "joinSession");
        limiter.remove_connection(&cid);
        assert!(!limiter.is_persistent_violator(&cid));
    }
}
