//! Clock synchronization and drift correction.
//!
//! Each connection's `latencyProbe` samples accumulate into a small ring
//! buffer of `serverTimestamp - clientTimestamp` offsets. The rolling
//! minimum of that buffer is the de-jittered clock-offset estimate (the
//! NTP-style assumption that the sample with the least round-trip padding
//! is closest to the true offset); the gap between the rolling mean and
//! that minimum is used as a jitter/latency proxy for ordering fan-out.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tempolink_types::{ConnectionId, Member};

const SAMPLE_CAPACITY: usize = 8;
/// A reported position more than this many milliseconds away from the
/// server's own tracked position triggers a `positionCorrection`.
const DEFAULT_DRIFT_THRESHOLD_MS: i64 = 25;

#[derive(Default)]
struct LatencyTracker {
    samples: VecDeque<i64>,
}

impl LatencyTracker {
    fn record(&mut self, offset_ms: i64) {
        if self.samples.len() == SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(offset_ms);
    }

    fn rolling_mean(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<i64>() / self.samples.len() as i64
    }

    fn rolling_min(&self) -> i64 {
        self.samples.iter().copied().min().unwrap_or(0)
    }

    fn latency_ms(&self) -> u32 {
        (self.rolling_mean() - self.rolling_min()).max(0) as u32
    }

    /// De-jittered estimate of `server_clock - client_clock`, in
    /// milliseconds. Positive means the client's clock reads behind the
    /// server's.
    fn offset_ms(&self) -> i64 {
        self.rolling_min()
    }
}

/// Mean and 95th-percentile measured latency across all tracked
/// connections, reported by `TelemetryBus`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyStats {
    pub mean_ms: u32,
    pub p95_ms: u32,
}

/// A drift correction to send back to the reporting connection.
pub struct DriftCorrection {
    pub correct_position_ms: u64,
    pub drift_ms: i64,
}

pub struct SyncEngine {
    trackers: RwLock<HashMap<ConnectionId, LatencyTracker>>,
    drift_threshold_ms: i64,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::with_drift_threshold(DEFAULT_DRIFT_THRESHOLD_MS)
    }

    pub fn with_drift_threshold(drift_threshold_ms: i64) -> Self {
        Self {
            trackers: RwLock::new(HashMap::new()),
            drift_threshold_ms,
        }
    }

    /// Records one `latencyProbe` sample and returns the server timestamp
    /// to echo back in `latencyResponse`.
    pub fn record_probe(&self, connection_id: &ConnectionId, client_timestamp: u64) -> u64 {
        let now = tempolink_types::now_ms();
        let offset = now as i64 - client_timestamp as i64;
        self.trackers
            .write()
            .entry(connection_id.clone())
            .or_default()
            .record(offset);
        now
    }

    pub fn measured_latency_ms(&self, connection_id: &ConnectionId) -> Option<u32> {
        self.trackers
            .read()
            .get(connection_id)
            .map(LatencyTracker::latency_ms)
    }

    /// Orders members by ascending measured latency (lowest-latency
    /// recipients first). Members with no samples yet sort last.
    pub fn order_by_latency(&self, mut members: Vec<Member>) -> Vec<Member> {
        let trackers = self.trackers.read();
        members.sort_by_key(|m| {
            trackers
                .get(&m.connection_id)
                .map(LatencyTracker::latency_ms)
                .unwrap_or(u32::MAX)
        });
        members
    }

    /// Compares a client-reported position against the server's
    /// authoritative one, returning a correction if the drift exceeds the
    /// threshold.
    ///
    /// `client_timestamp` is when the client captured `reported_position_ms`
    /// on its own clock; `is_playing` is the session's current transport
    /// state. Both are used to correct for the gap between "now" (when
    /// `expected_position_ms` was read) and the moment the client actually
    /// took its reading, so that message latency and clock skew aren't
    /// misread as position drift: while playing, `expected_position_ms` is
    /// rolled back by the elapsed time (in the connection's own clock
    /// frame, via its tracked offset) between the client's reading and now.
    pub fn check_drift(
        &self,
        connection_id: &ConnectionId,
        expected_position_ms: u64,
        reported_position_ms: u64,
        client_timestamp: u64,
        is_playing: bool,
    ) -> Option<DriftCorrection> {
        let offset_ms = self
            .trackers
            .read()
            .get(connection_id)
            .map(LatencyTracker::offset_ms)
            .unwrap_or(0);

        let comparison_position_ms = if is_playing {
            let now = tempolink_types::now_ms() as i64;
            let client_time_in_server_clock = client_timestamp as i64 + offset_ms;
            let elapsed_since_report = (now - client_time_in_server_clock).max(0) as u64;
            expected_position_ms.saturating_sub(elapsed_since_report)
        } else {
            expected_position_ms
        };

        let drift = comparison_position_ms as i64 - reported_position_ms as i64;
        if drift.abs() > self.drift_threshold_ms {
            Some(DriftCorrection {
                correct_position_ms: expected_position_ms,
                drift_ms: drift,
            })
        } else {
            None
        }
    }

    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        self.trackers.write().remove(connection_id);
    }

    /// Mean and p95 measured latency across every connection with at least
    /// one recorded probe. Used by `TelemetryBus`'s periodic report.
    pub fn latency_stats(&self) -> LatencyStats {
        let trackers = self.trackers.read();
        let mut samples: Vec<u32> = trackers
            .values()
            .filter(|t| !t.samples.is_empty())
            .map(LatencyTracker::latency_ms)
            .collect();
        if samples.is_empty() {
            return LatencyStats::default();
        }
        samples.sort_unstable();
        let mean_ms = (samples.iter().map(|&v| v as u64).sum::<u64>() / samples.len() as u64) as u32;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize)
            .saturating_sub(1)
            .min(samples.len() - 1);
        LatencyStats {
            mean_ms,
            p95_ms: samples[p95_index],
        }
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempolink_types::SessionId;

    fn member(cid: &str) -> Member {
        Member::new(SessionId::from("s1"), ConnectionId::from(cid.to_string()), cid.into())
    }

    #[test]
    fn rolling_min_tracks_the_least_jittered_sample() {
        let engine = SyncEngine::new();
        let cid = ConnectionId::from("c1".to_string());
        // client_timestamp chosen so offset = now - client_timestamp is
        // deterministic regardless of when the test runs.
        let now = tempolink_types::now_ms();
        engine.record_probe(&cid, now - 50);
        engine.record_probe(&cid, now - 10);
        engine.record_probe(&cid, now - 40);
        // rolling_min should be close to 10 (the least-padded sample).
        let latency = engine.measured_latency_ms(&cid).unwrap();
        assert!(latency <= 40);
    }

    #[test]
    fn members_without_samples_sort_last() {
        let engine = SyncEngine::new();
        let a = ConnectionId::from("a".to_string());
        engine.record_probe(&a, tempolink_types::now_ms());
        let members = vec![member("b"), member("a")];
        let ordered = engine.order_by_latency(members);
        assert_eq!(ordered[0].connection_id, a);
    }

    #[test]
    fn drift_within_threshold_is_not_corrected() {
        let engine = SyncEngine::new();
        let cid = ConnectionId::from("c1".to_string());
        let now = tempolink_types::now_ms();
        assert!(engine.check_drift(&cid, 1000, 995, now, false).is_none());
    }

    #[test]
    fn drift_beyond_threshold_is_corrected() {
        let engine = SyncEngine::new();
        let cid = ConnectionId::from("c1".to_string());
        let now = tempolink_types::now_ms();
        let correction = engine.check_drift(&cid, 1000, 900, now, false).unwrap();
        assert_eq!(correction.correct_position_ms, 1000);
        assert_eq!(correction.drift_ms, 100);
    }

    #[test]
    fn drift_while_playing_accounts_for_elapsed_report_time() {
        let engine = SyncEngine::new();
        let cid = ConnectionId::from("c1".to_string());
        // No recorded offset yet, so the elapsed-time correction alone is
        // exercised: a report timestamped well in the past, while playing,
        // should not be flagged as drift merely because position has since
        // advanced past it.
        let stale_timestamp = tempolink_types::now_ms().saturating_sub(5_000);
        assert!(engine
            .check_drift(&cid, 6000, 1000, stale_timestamp, true)
            .is_none());
    }

    #[test]
    fn latency_stats_are_empty_with_no_samples() {
        let engine = SyncEngine::new();
        let stats = engine.latency_stats();
        assert_eq!(stats.mean_ms, 0);
        assert_eq!(stats.p95_ms, 0);
    }

    #[test]
    fn latency_stats_aggregate_recorded_connections() {
        let engine = SyncEngine::new();
        let a = ConnectionId::from("a".to_string());
        let b = ConnectionId::from("b".to_string());
        // Two samples per connection so each has non-zero jitter spread,
        // and thus a non-zero measured latency to aggregate.
        engine.record_probe(&a, tempolink_types::now_ms() - 50);
        engine.record_probe(&a, tempolink_types::now_ms() - 10);
        engine.record_probe(&b, tempolink_types::now_ms() - 200);
        engine.record_probe(&b, tempolink_types::now_ms() - 20);
        let stats = engine.latency_stats();
        assert!(stats.p95_ms >= stats.mean_ms);
    }
}
