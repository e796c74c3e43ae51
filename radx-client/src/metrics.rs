//! # Client Metrics
//!
//! Lightweight counters and a latency histogram per Connection, used to
//! compute request rate, failure rate, retry pressure and tail latency.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Plain Snapshots**: Readers get owned structs, never references into live counters.
//!
//! ## Notes
//! - `NotFound` is an answer, not a failure, and is not counted in `errors_total`.
//! - Bucket boundaries are expressed in microseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use radx_common::ErrorKind;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 14] = [
    10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000,
];

/// Snapshot of all client metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total number of operations started.
    pub requests_total: u64,
    /// Operations that ended in a failure (NotFound excluded).
    pub errors_total: u64,
    /// Extra attempts issued by the retry loop.
    pub retries_total: u64,
    /// Operations that hit their deadline.
    pub timeouts_total: u64,
    /// Operations cancelled before or during execution.
    pub cancelled_total: u64,
    /// Operations currently executing.
    pub inflight: u64,
    /// Latency histogram snapshot.
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Returns the upper bound (µs) of the bucket holding quantile `q` in `[0, 1]`.
    ///
    /// `None` when there are no samples; `u64::MAX` when the quantile lands in
    /// the overflow bucket.
    pub fn quantile_upper_bound_us(&self, q: f64) -> Option<u64> {
        if self.samples == 0 {
            return None;
        }
        let rank = ((self.samples as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return Some(self.bounds_us.get(idx).copied().unwrap_or(u64::MAX));
            }
        }
        Some(u64::MAX)
    }
}

/// Thread-safe metrics aggregator for one Connection.
///
/// `Ordering::Relaxed` is sufficient: counters are independent and readers
/// only need eventually consistent values.
#[derive(Debug)]
pub struct Metrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    retries_total: AtomicU64,
    timeouts_total: AtomicU64,
    cancelled_total: AtomicU64,
    inflight: AtomicU64,
    latency: LatencyHistogram,
}

impl Metrics {
    /// Creates a new metrics aggregator with the default latency buckets.
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a new metrics aggregator with custom latency bucket boundaries.
    ///
    /// The boundaries must be sorted ascending and represent microseconds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        Metrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    /// Records the start of an operation.
    pub fn record_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of an operation and its latency.
    pub fn record_request_end(&self, latency: Duration) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    /// Records one extra attempt.
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed operation by error kind.
    pub fn record_failure(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::NotFound => return,
            ErrorKind::Timeout => {
                self.timeouts_total.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::Cancelled => {
                self.cancelled_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
            _ => {}
        }
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a submission cancelled before it was dispatched.
    pub fn record_cancelled_pending(&self) {
        self.cancelled_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; the list is short and stays hot in cache.
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

    /// Records a latency measurement.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
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
    fn histogram_buckets_and_overflow() {
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
    fn quantiles_use_bucket_bounds() {
        let histogram = LatencyHistogram::new(vec![10, 100]);
        for _ in 0..9 {
            histogram.record(Duration::from_micros(3));
        }
        histogram.record(Duration::from_micros(70));

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.quantile_upper_bound_us(0.5), Some(10));
        assert_eq!(snapshot.quantile_upper_bound_us(1.0), Some(100));
        assert_eq!(LatencyHistogram::new(vec![1]).snapshot().quantile_upper_bound_us(0.5), None);
    }

    #[test]
    fn not_found_is_not_a_failure() {
        let metrics = Metrics::new();
        metrics.record_failure(ErrorKind::NotFound);
        metrics.record_failure(ErrorKind::Io);
        metrics.record_failure(ErrorKind::Timeout);
        metrics.record_failure(ErrorKind::Cancelled);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors_total, 2);
        assert_eq!(snapshot.timeouts_total, 1);
        assert_eq!(snapshot.cancelled_total, 1);
    }

    #[test]
    fn inflight_tracks_start_and_end() {
        let metrics = Metrics::new();
        metrics.record_request_start();
        metrics.record_request_start();
        metrics.record_request_end(Duration::from_micros(1));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.inflight, 1);
        assert_eq!(snapshot.latency.samples, 1);
    }
}
