//! Executor counters and task latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "telemetry")]
use hdrhistogram::Histogram;
#[cfg(feature = "telemetry")]
use parking_lot::RwLock;

/// Runtime metrics collector shared by all workers of one executor.
#[derive(Debug)]
pub struct Metrics {
    host_tasks: AtomicU64,
    device_tasks: AtomicU64,
    tasks_stolen: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_panicked: AtomicU64,
    tasks_skipped: AtomicU64,
    graph_launches: AtomicU64,
    runs_completed: AtomicU64,

    #[cfg(feature = "telemetry")]
    latency_histogram: Option<RwLock<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            host_tasks: AtomicU64::new(0),
            device_tasks: AtomicU64::new(0),
            tasks_stolen: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            tasks_skipped: AtomicU64::new(0),
            graph_launches: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            // one hour in nanoseconds, 3 significant figures
            #[cfg(feature = "telemetry")]
            latency_histogram: Histogram::new_with_max(3_600_000_000_000, 3)
                .ok()
                .map(RwLock::new),
            start_time: Instant::now(),
        }
    }

    /// Counters only when `latency` is false.
    pub fn with_latency(latency: bool) -> Self {
        #[allow(unused_mut)]
        let mut metrics = Self::new();
        #[cfg(feature = "telemetry")]
        if !latency {
            metrics.latency_histogram = None;
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = latency;
        metrics
    }

    pub fn record_host_task(&self, duration_ns: u64) {
        self.host_tasks.fetch_add(1, Ordering::Relaxed);
        self.record_latency(duration_ns);
    }

    pub fn record_device_task(&self, duration_ns: u64) {
        self.device_tasks.fetch_add(1, Ordering::Relaxed);
        self.record_latency(duration_ns);
    }

    pub fn record_task_stolen(&self) {
        self.tasks_stolen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_panic(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_graph_launches(&self, launches: u64) {
        self.graph_launches.fetch_add(launches, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(feature = "telemetry")]
    fn record_latency(&self, duration_ns: u64) {
        if let Some(histogram) = &self.latency_histogram {
            if let Some(mut hist) = histogram.try_write() {
                let _ = hist.record(duration_ns);
            }
        }
    }

    #[cfg(not(feature = "telemetry"))]
    fn record_latency(&self, _duration_ns: u64) {}

    pub fn snapshot(&self) -> MetricsSnapshot {
        #[allow(unused_mut)]
        let mut snapshot = MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            host_tasks: self.host_tasks.load(Ordering::Relaxed),
            device_tasks: self.device_tasks.load(Ordering::Relaxed),
            tasks_stolen: self.tasks_stolen.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            tasks_skipped: self.tasks_skipped.load(Ordering::Relaxed),
            graph_launches: self.graph_launches.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            avg_latency_ns: 0,
            p50_latency_ns: 0,
            p99_latency_ns: 0,
            max_latency_ns: 0,
        };

        #[cfg(feature = "telemetry")]
        if let Some(histogram) = &self.latency_histogram {
            let hist = histogram.read();
            if hist.len() > 0 {
                snapshot.avg_latency_ns = hist.mean() as u64;
                snapshot.p50_latency_ns = hist.value_at_quantile(0.50);
                snapshot.p99_latency_ns = hist.value_at_quantile(0.99);
                snapshot.max_latency_ns = hist.max();
            }
        }

        snapshot
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
    pub uptime: Duration,
    pub host_tasks: u64,
    pub device_tasks: u64,
    pub tasks_stolen: u64,
    pub tasks_failed: u64,
    pub tasks_panicked: u64,
    pub tasks_skipped: u64,
    pub graph_launches: u64,
    pub runs_completed: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    pub fn tasks_executed(&self) -> u64 {
        self.host_tasks + self.device_tasks
    }

    pub fn tasks_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.tasks_executed() as f64 / seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_host_task(1000);
        metrics.record_device_task(2000);
        metrics.record_task_stolen();
        metrics.record_graph_launches(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.host_tasks, 1);
        assert_eq!(snapshot.device_tasks, 1);
        assert_eq!(snapshot.tasks_executed(), 2);
        assert_eq!(snapshot.tasks_stolen, 1);
        assert_eq!(snapshot.graph_launches, 3);
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_latency_histogram() {
        let metrics = Metrics::new();
        metrics.record_host_task(1000);
        metrics.record_host_task(3000);

        let snapshot = metrics.snapshot();
        assert!(snapshot.avg_latency_ns > 0);
        assert!(snapshot.max_latency_ns >= 2900);
    }

    #[test]
    fn test_counters_without_latency() {
        let metrics = Metrics::with_latency(false);
        metrics.record_device_task(5000);
        metrics.record_task_skipped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.device_tasks, 1);
        assert_eq!(snapshot.tasks_skipped, 1);
        assert_eq!(snapshot.max_latency_ns, 0);
    }
}
