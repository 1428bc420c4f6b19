//! Admission metrics collection.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters and latency distribution for the admission pipeline.
#[derive(Debug)]
pub struct Metrics {
    pods_admitted: AtomicU64,
    pods_denied: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    admission_latency: RwLock<Histogram<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, up to one minute in nanoseconds
        let histogram =
            Histogram::new_with_max(60_000_000_000, 3).expect("failed to create histogram");
        Metrics {
            pods_admitted: AtomicU64::new(0),
            pods_denied: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            admission_latency: RwLock::new(histogram),
        }
    }

    /// Record one pod admission attempt and its latency.
    pub fn record_admission(&self, admitted: bool, latency: Duration) {
        if admitted {
            self.pods_admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pods_denied.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(mut histogram) = self.admission_latency.try_write() {
            let _ = histogram.record(latency.as_nanos() as u64);
        }
    }

    /// Record one successful container allocation.
    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one container release.
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the current counters and latency percentiles.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.admission_latency.read();
        MetricsSnapshot {
            pods_admitted: self.pods_admitted.load(Ordering::Relaxed),
            pods_denied: self.pods_denied.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            p50_admission_ns: histogram.value_at_quantile(0.50),
            p99_admission_ns: histogram.value_at_quantile(0.99),
            max_admission_ns: histogram.max(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

/// Point-in-time view of the admission metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub pods_admitted: u64,
    pub pods_denied: u64,
    pub allocations: u64,
    pub releases: u64,
    pub p50_admission_ns: u64,
    pub p99_admission_ns: u64,
    pub max_admission_ns: u64,
}
