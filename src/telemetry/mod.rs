//! Runtime metrics.
//!
//! Counts registrations and dispatches and keeps a dispatch latency
//! histogram.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Duration;

    #[derive(Debug, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self {
            Self
        }
        pub fn disabled() -> Self {
            Self
        }
        pub fn is_enabled(&self) -> bool {
            false
        }
        pub fn record_compile(&self, _: bool) {}
        pub fn record_allocation(&self, _: usize) {}
        pub fn record_allocation_failure(&self) {}
        pub fn record_dispatch(&self, _: Duration) {}
        pub fn record_dispatch_failure(&self) {}
        pub fn reset(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
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
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
