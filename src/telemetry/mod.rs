//! Telemetry for the executor.
//!
//! Counters are always collected; the latency histogram is compiled in with
//! the `telemetry` feature.

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
