//! # Facade Metrics
//!
//! Provide lightweight counters and a latency histogram for cache command
//! attempts, so a reporter can derive throughput, retry rate, and tail
//! latency without the facade depending on any metrics backend.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Fixed Buckets**: Keep histogram buckets in a contiguous array for cache locality.
//! 3. **Pull, Not Push**: Exporters poll `snapshot()`; nothing here calls out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 500_000,
];

/// How a single command attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Retryable,
    Fatal,
    /// The caller stopped waiting before the attempt finished.
    Cancelled,
}

/// Snapshot of all facade metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub attempts_total: u64,
    pub successes_total: u64,
    /// Attempts that failed, retryable or not.
    pub failures_total: u64,
    /// Attempts started because an earlier one failed retryably.
    pub retries_total: u64,
    /// Attempts abandoned because the caller's future was dropped.
    pub cancelled_total: u64,
    pub inflight: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

/// Thread-safe metrics aggregator for the cache facade.
///
/// `Ordering::Relaxed` is sufficient because we do not require cross-field
/// ordering, only eventual consistency.
#[derive(Debug)]
pub struct CacheMetrics {
    attempts_total: AtomicU64,
    successes_total: AtomicU64,
    failures_total: AtomicU64,
    retries_total: AtomicU64,
    cancelled_total: AtomicU64,
    inflight: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    /// Creates a new metrics aggregator with the default latency buckets.
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a new metrics aggregator with custom latency bucket boundaries.
    ///
    /// The boundaries must be sorted ascending and represent microseconds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        CacheMetrics {
            attempts_total: AtomicU64::new(0),
            successes_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    pub fn record_attempt_start(&self) {
        self.attempts_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Starts an attempt and returns a guard that ends it.
    ///
    /// **Input**: none.
    /// **Output**: an `AttemptTimer` borrowing these metrics.
    ///
    /// **Logic**:
    /// 1. Count the attempt and raise `inflight`.
    /// 2. Capture the start instant for the latency sample.
    /// 3. The guard records the end on `finish`, or as cancelled on drop.
    pub fn start_attempt(&self) -> AttemptTimer<'_> {
        self.record_attempt_start();
        AttemptTimer {
            metrics: self,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Records the end of an attempt started with `record_attempt_start`.
    ///
    /// **Input**: `latency` of the attempt and how it ended.
    /// **Output**: none (side-effects only).
    ///
    /// **Logic**:
    /// 1. Decrement `inflight`.
    /// 2. Record the latency into the histogram.
    /// 3. Bump the counter for `outcome`.
    pub fn record_attempt_end(&self, latency: Duration, outcome: AttemptOutcome) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.latency.record(latency);
        let counter = match outcome {
            AttemptOutcome::Success => &self.successes_total,
            AttemptOutcome::Retryable | AttemptOutcome::Fatal => &self.failures_total,
            AttemptOutcome::Cancelled => &self.cancelled_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts_total: self.attempts_total.load(Ordering::Relaxed),
            successes_total: self.successes_total.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// One attempt in progress; see [`CacheMetrics::start_attempt`].
pub struct AttemptTimer<'a> {
    metrics: &'a CacheMetrics,
    started: Instant,
    finished: bool,
}

impl AttemptTimer<'_> {
    pub fn finish(mut self, outcome: AttemptOutcome) {
        self.finished = true;
        self.metrics
            .record_attempt_end(self.started.elapsed(), outcome);
    }
}

impl Drop for AttemptTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics
                .record_attempt_end(self.started.elapsed(), AttemptOutcome::Cancelled);
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; this is O(buckets) but the list is small
/// and stays hot in cache.
#[derive(Debug)]
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_places_samples_in_buckets() {
        let histogram = LatencyHistogram::new(vec![10, 100]);
        histogram.record(Duration::from_micros(5));
        histogram.record(Duration::from_micros(10));
        histogram.record(Duration::from_micros(50));
        histogram.record(Duration::from_millis(5));

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.buckets, vec![2, 1, 1]);
        assert_eq!(snapshot.samples, 4);
        assert_eq!(snapshot.sum_us, 5 + 10 + 50 + 5_000);
    }

    #[test]
    fn attempts_track_outcomes_and_inflight() {
        let metrics = CacheMetrics::new();
        metrics.record_attempt_start();
        metrics.record_attempt_start();
        assert_eq!(metrics.snapshot().inflight, 2);

        metrics.record_attempt_end(Duration::from_micros(80), AttemptOutcome::Retryable);
        metrics.record_retry();
        metrics.record_attempt_end(Duration::from_micros(120), AttemptOutcome::Success);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts_total, 2);
        assert_eq!(snapshot.successes_total, 1);
        assert_eq!(snapshot.failures_total, 1);
        assert_eq!(snapshot.retries_total, 1);
        assert_eq!(snapshot.inflight, 0);
        assert_eq!(snapshot.latency.samples, 2);
    }

    #[test]
    fn dropped_attempt_is_counted_as_cancelled() {
        let metrics = CacheMetrics::new();
        metrics.start_attempt().finish(AttemptOutcome::Success);
        drop(metrics.start_attempt());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts_total, 2);
        assert_eq!(snapshot.successes_total, 1);
        assert_eq!(snapshot.cancelled_total, 1);
        assert_eq!(snapshot.failures_total, 0);
        assert_eq!(snapshot.inflight, 0);
    }
}
