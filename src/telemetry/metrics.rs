//! Runtime counters and dispatch latency.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Runtime metrics collector
#[derive(Debug)]
pub struct Metrics {
    enabled: AtomicBool,

    // Registry counters
    kernels_compiled: AtomicU64,
    compile_failures: AtomicU64,
    buffers_allocated: AtomicU64,
    bytes_allocated: AtomicU64,
    allocation_failures: AtomicU64,

    // Dispatch counters
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
    busy_time_ns: AtomicU64,

    // None if the histogram could not be created
    latency_histogram: Option<RwLock<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, up to one hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .ok()
            .map(RwLock::new);

        Self {
            enabled: AtomicBool::new(true),
            kernels_compiled: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            buffers_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            busy_time_ns: AtomicU64::new(0),
            latency_histogram: histogram,
            start_time: Instant::now(),
        }
    }

    /// A collector that ignores every record call.
    pub fn disabled() -> Self {
        let metrics = Self::new();
        metrics.enabled.store(false, Ordering::Relaxed);
        metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn add(&self, counter: &AtomicU64, n: u64) {
        if self.is_enabled() {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_compile(&self, ok: bool) {
        if ok {
            self.add(&self.kernels_compiled, 1);
        } else {
            self.add(&self.compile_failures, 1);
        }
    }

    pub fn record_allocation(&self, bytes: usize) {
        self.add(&self.buffers_allocated, 1);
        self.add(&self.bytes_allocated, bytes as u64);
    }

    pub fn record_allocation_failure(&self) {
        self.add(&self.allocation_failures, 1);
    }

    /// Record a completed dispatch and its wall-clock duration.
    pub fn record_dispatch(&self, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.busy_time_ns.fetch_add(ns, Ordering::Relaxed);

        if let Some(histogram) = &self.latency_histogram {
            if let Some(mut hist) = histogram.try_write() {
                let _ = hist.record(ns);
            }
        }
    }

    pub fn record_dispatch_failure(&self) {
        self.add(&self.dispatch_failures, 1);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg, p50, p95, p99, max) = match &self.latency_histogram {
            Some(histogram) => {
                let h = histogram.read();
                if h.len() > 0 {
                    (
                        h.mean() as u64,
                        h.value_at_quantile(0.50),
                        h.value_at_quantile(0.95),
                        h.value_at_quantile(0.99),
                        h.max(),
                    )
                } else {
                    (0, 0, 0, 0, 0)
                }
            }
            None => (0, 0, 0, 0, 0),
        };

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            kernels_compiled: self.kernels_compiled.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            busy_time_ns: self.busy_time_ns.load(Ordering::Relaxed),
            avg_latency_ns: avg,
            p50_latency_ns: p50,
            p95_latency_ns: p95,
            p99_latency_ns: p99,
            max_latency_ns: max,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.kernels_compiled,
            &self.compile_failures,
            &self.buffers_allocated,
            &self.bytes_allocated,
            &self.allocation_failures,
            &self.dispatches,
            &self.dispatch_failures,
            &self.busy_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        if let Some(histogram) = &self.latency_histogram {
            histogram.write().reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    pub kernels_compiled: u64,
    pub compile_failures: u64,
    pub buffers_allocated: u64,
    pub bytes_allocated: u64,
    pub allocation_failures: u64,
    pub dispatches: u64,
    pub dispatch_failures: u64,
    pub busy_time_ns: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p95_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    pub fn dispatches_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.dispatches as f64 / seconds
    }

    /// Fraction of uptime spent inside dispatches.
    pub fn utilization(&self) -> f64 {
        let uptime = self.uptime.as_nanos() as f64;
        if uptime == 0.0 {
            return 0.0;
        }
        (self.busy_time_ns as f64 / uptime).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_compile(true);
        metrics.record_compile(false);
        metrics.record_allocation(400);
        metrics.record_dispatch(Duration::from_micros(1));
        metrics.record_dispatch(Duration::from_micros(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.kernels_compiled, 1);
        assert_eq!(snapshot.compile_failures, 1);
        assert_eq!(snapshot.buffers_allocated, 1);
        assert_eq!(snapshot.bytes_allocated, 400);
        assert_eq!(snapshot.dispatches, 2);
        assert_eq!(snapshot.busy_time_ns, 3_000);
        assert!(snapshot.avg_latency_ns > 0);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_dispatch(Duration::from_nanos(1000));
        assert_eq!(metrics.snapshot().dispatches, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatches, 0);
        assert_eq!(snapshot.max_latency_ns, 0);
    }

    #[test]
    fn test_disabled_ignores_records() {
        let metrics = Metrics::disabled();
        metrics.record_allocation(10);
        metrics.record_dispatch(Duration::from_millis(1));
        metrics.record_dispatch_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.buffers_allocated, 0);
        assert_eq!(snapshot.dispatches, 0);
        assert_eq!(snapshot.dispatch_failures, 0);
    }

    #[test]
    fn test_utilization() {
        let mut snapshot = Metrics::new().snapshot();
        snapshot.uptime = Duration::from_secs(2);
        snapshot.busy_time_ns = 1_000_000_000;
        assert_eq!(snapshot.utilization(), 0.5);

        snapshot.dispatches = 10;
        assert_eq!(snapshot.dispatches_per_second(), 5.0);
    }
}
