//! Process-wide test metrics.
//!
//! Counters are atomics and read lock-free; the running mean sits behind a
//! small read/write lock. A snapshot does not need a consistent
//! cross-counter view, the counters are monotonic and tolerate skew.

pub mod sampler;
pub mod server;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relaytest_common::TestResultData;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

struct MeanState {
    mean_seconds: f64,
    samples: u64,
}

/// Aggregated counters for the lifetime of the tester.
///
/// Initialized once at tester start and passed around as an explicit
/// dependency; every task completion funnels through [`Metrics::record`].
pub struct Metrics {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    active_processes: AtomicI64,
    memory_usage_mb: AtomicU64,
    mean: RwLock<MeanState>,
    started: Instant,
    start_time: DateTime<Utc>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            active_processes: AtomicI64::new(0),
            memory_usage_mb: AtomicU64::new(0),
            mean: RwLock::new(MeanState {
                mean_seconds: 0.0,
                samples: 0,
            }),
            started: Instant::now(),
            start_time: Utc::now(),
        }
    }

    /// Fold one finished task into the counters.
    ///
    /// Every non-success outcome counts as a failure; only successful
    /// samples move the running mean.
    pub fn record(&self, result: &TestResultData) {
        self.total.fetch_add(1, Ordering::Relaxed);

        if result.result.is_success() {
            self.success.fetch_add(1, Ordering::Relaxed);

            let sample = result.response_time_ms as f64 / 1000.0;
            let mut mean = self.mean.write();
            mean.samples += 1;
            mean.mean_seconds += (sample - mean.mean_seconds) / mean.samples as f64;
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Gauge hook: a core process spawned successfully.
    pub fn process_started(&self) {
        self.active_processes.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauge hook: a core process was reaped. Single decrement point.
    pub fn process_stopped(&self) {
        self.active_processes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_processes(&self) -> i64 {
        self.active_processes.load(Ordering::Relaxed)
    }

    pub fn set_memory_usage_mb(&self, mb: u64) {
        self.memory_usage_mb.store(mb, Ordering::Relaxed);
    }

    pub fn memory_usage_mb(&self) -> u64 {
        self.memory_usage_mb.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        let mean_seconds = self.mean.read().mean_seconds;

        MetricsSnapshot {
            total_tests: total,
            successful_tests: success,
            failed_tests: failure,
            success_rate: success as f64 / total.max(1) as f64 * 100.0,
            avg_response_time_seconds: mean_seconds,
            memory_usage_mb: self.memory_usage_mb(),
            active_processes: self.active_processes(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view served on `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_tests: u64,
    pub successful_tests: u64,
    pub failed_tests: u64,
    pub success_rate: f64,
    pub avg_response_time_seconds: f64,
    pub memory_usage_mb: u64,
    pub active_processes: i64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaytest_common::{Protocol, ProxyConfig, TestResult};
    use std::time::Duration;

    fn result_of(kind: TestResult, ms: u64) -> TestResultData {
        let cfg = ProxyConfig::new("m", Protocol::Socks, "10.0.0.1", 1080);
        if kind.is_success() {
            TestResultData::success(cfg, 1, Duration::from_millis(ms))
        } else {
            TestResultData::outcome(cfg, 1, kind, "x")
        }
    }

    #[test]
    fn counters_track_successes_and_failures() {
        let metrics = Metrics::new();
        metrics.record(&result_of(TestResult::Success, 100));
        metrics.record(&result_of(TestResult::Timeout, 0));
        metrics.record(&result_of(TestResult::LaunchFailed, 0));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_tests, 3);
        assert_eq!(snap.successful_tests, 1);
        assert_eq!(snap.failed_tests, 2);
        assert_eq!(snap.total_tests, snap.successful_tests + snap.failed_tests);
    }

    #[test]
    fn mean_covers_successful_samples_only() {
        let metrics = Metrics::new();
        metrics.record(&result_of(TestResult::Success, 100));
        metrics.record(&result_of(TestResult::Timeout, 0));
        metrics.record(&result_of(TestResult::Success, 200));

        let snap = metrics.snapshot();
        assert!((snap.avg_response_time_seconds - 0.15).abs() < 1e-9);
    }

    #[test]
    fn success_rate_is_zero_safe() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().success_rate, 0.0);
    }

    #[test]
    fn active_process_gauge_balances() {
        let metrics = Metrics::new();
        metrics.process_started();
        metrics.process_started();
        assert_eq!(metrics.active_processes(), 2);
        metrics.process_stopped();
        metrics.process_stopped();
        assert_eq!(metrics.active_processes(), 0);
    }

    #[test]
    fn snapshot_serializes_with_stable_field_names() {
        let metrics = Metrics::new();
        metrics.record(&result_of(TestResult::Success, 50));
        let value = serde_json::to_value(metrics.snapshot()).unwrap();

        for key in [
            "total_tests",
            "successful_tests",
            "failed_tests",
            "success_rate",
            "avg_response_time_seconds",
            "memory_usage_mb",
            "active_processes",
            "uptime_seconds",
        ] {
            assert!(value.get(key).is_some(), "missing field {}", key);
        }
        assert_eq!(value["success_rate"], 100.0);
    }
}
