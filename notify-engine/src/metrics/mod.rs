//! Metrics module.
//!
//! Counters and histograms for deliveries, circuit breakers and the audit
//! pipeline, with a Prometheus text exporter.
//!
//! # Example
//!
//! ```ignore
//! use notify_engine::metrics::{MetricsCollector, PrometheusExporter};
//!
//! let collector = Arc::new(MetricsCollector::new());
//! collector.record_attempt("webhook", true, Duration::from_millis(40));
//!
//! let text = PrometheusExporter::new(collector).export();
//! ```

mod collector;
mod prometheus;

pub use collector::{
    HistogramSnapshot, LATENCY_BUCKETS_MS, LatencyHistogram, MetricsCollector, MetricsSnapshot,
};
pub use prometheus::PrometheusExporter;
