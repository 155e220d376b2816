//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use super::collector::{HistogramSnapshot, MetricsCollector};

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter.
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            namespace: "notify_engine".to_string(),
        }
    }

    /// Create a new Prometheus exporter with custom namespace.
    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        // Delivery metrics
        self.write_labeled(
            &mut output,
            "delivery_attempts_total",
            "Delivery attempts by channel",
            "counter",
            "channel",
            &snapshot.attempts,
        );
        self.write_labeled(
            &mut output,
            "delivery_successes_total",
            "Successful delivery attempts by channel",
            "counter",
            "channel",
            &snapshot.successes,
        );
        self.write_labeled(
            &mut output,
            "delivery_failures_total",
            "Failed delivery attempts by channel",
            "counter",
            "channel",
            &snapshot.failures,
        );
        self.write_labeled(
            &mut output,
            "delivery_attempt_duration_ms_total",
            "Total time spent in delivery attempts by channel",
            "counter",
            "channel",
            &snapshot.attempt_duration_total_ms,
        );
        self.write_labeled(
            &mut output,
            "circuit_rejections_total",
            "Channels skipped because their circuit was open",
            "counter",
            "channel",
            &snapshot.circuit_rejections,
        );
        self.write_circuit_transitions(&mut output, &snapshot.circuit_transitions);
        self.write_labeled(
            &mut output,
            "notifications_total",
            "Completed notifications by phase",
            "counter",
            "phase",
            &snapshot.deliveries_by_phase,
        );

        // Audit metrics
        self.write_counter(
            &mut output,
            "audit_events_buffered_total",
            "Audit events accepted into the buffer",
            snapshot.audit_buffered,
        );
        self.write_counter(
            &mut output,
            "audit_events_written_total",
            "Audit events written to storage",
            snapshot.audit_written,
        );
        self.write_counter(
            &mut output,
            "audit_events_dead_lettered_total",
            "Audit events pushed to the dead-letter queue",
            snapshot.audit_dead_lettered,
        );
        self.write_counter(
            &mut output,
            "audit_events_dropped_total",
            "Audit events dropped, across reasons",
            snapshot.audit_dropped.values().sum(),
        );
        self.write_labeled(
            &mut output,
            "audit_events_dropped_by_reason_total",
            "Audit events dropped by reason",
            "counter",
            "reason",
            &snapshot.audit_dropped,
        );
        self.write_counter(
            &mut output,
            "audit_write_failures_total",
            "Failed audit batch writes",
            snapshot.audit_write_failures,
        );
        self.write_histogram(
            &mut output,
            "audit_batch_write_duration_ms",
            "Audit batch write latency in milliseconds",
            &snapshot.audit_batch_latency,
        );

        output
    }

    fn header(&self, output: &mut String, name: &str, help: &str, kind: &str) -> String {
        let full_name = format!("{}_{}", self.namespace, name);
        let _ = writeln!(output, "# HELP {} {}", full_name, help);
        let _ = writeln!(output, "# TYPE {} {}", full_name, kind);
        full_name
    }

    fn write_counter(&self, output: &mut String, name: &str, help: &str, value: u64) {
        let full_name = self.header(output, name, help, "counter");
        let _ = writeln!(output, "{} {}", full_name, value);
    }

    fn write_labeled(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        kind: &str,
        label: &str,
        values: &BTreeMap<String, u64>,
    ) {
        if values.is_empty() {
            return;
        }
        let full_name = self.header(output, name, help, kind);
        for (key, value) in values {
            let _ = writeln!(
                output,
                "{}{{{}=\"{}\"}} {}",
                full_name,
                label,
                escape(key),
                value
            );
        }
    }

    fn write_circuit_transitions(&self, output: &mut String, values: &BTreeMap<String, u64>) {
        if values.is_empty() {
            return;
        }
        let full_name = self.header(
            output,
            "circuit_transitions_total",
            "Circuit breaker transitions by channel and target state",
            "counter",
        );
        for (key, value) in values {
            // Keys are `channel:state`; channel ids may themselves contain ':'.
            let (channel, state) = key.rsplit_once(':').unwrap_or((key.as_str(), ""));
            let _ = writeln!(
                output,
                "{}{{channel=\"{}\",state=\"{}\"}} {}",
                full_name,
                escape(channel),
                state,
                value
            );
        }
    }

    fn write_histogram(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        histogram: &HistogramSnapshot,
    ) {
        let full_name = self.header(output, name, help, "histogram");
        for (bound, count) in &histogram.buckets {
            let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", full_name, bound, count);
        }
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", full_name, histogram.count);
        let _ = writeln!(output, "{}_sum {}", full_name, histogram.sum_ms);
        let _ = writeln!(output, "{}_count {}", full_name, histogram.count);
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
