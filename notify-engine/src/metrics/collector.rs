//! Metrics collector implementation.
//!
//! Collects counters and histograms for the delivery engine. Everything is
//! lock-free on the hot path: plain atomics for global counters and
//! `DashMap` entries for labelled ones.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::notification::{CircuitState, DeliveryPhase};

/// Upper bounds (milliseconds) of the audit batch write latency buckets.
pub const LATENCY_BUCKETS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000];

/// Fixed-bucket latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    overflow: AtomicU64,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        match LATENCY_BUCKETS_MS.iter().position(|bound| ms <= *bound) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        // Cumulative counts, Prometheus style.
        let mut cumulative = 0;
        let buckets = LATENCY_BUCKETS_MS
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, count)| {
                cumulative += count.load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();
        HistogramSnapshot {
            buckets,
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Cumulative histogram view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// `(upper_bound_ms, cumulative_count)`.
    pub buckets: Vec<(u64, u64)>,
    pub sum_ms: u64,
    pub count: u64,
}

/// Metrics collector for the delivery engine.
#[derive(Debug)]
pub struct MetricsCollector {
    // Delivery metrics
    attempts: DashMap<String, AtomicU64>,
    successes: DashMap<String, AtomicU64>,
    failures: DashMap<String, AtomicU64>,
    attempt_duration_total_ms: DashMap<String, AtomicU64>,
    circuit_rejections: DashMap<String, AtomicU64>,
    circuit_transitions: DashMap<String, AtomicU64>,
    deliveries_by_phase: DashMap<String, AtomicU64>,

    // Audit metrics
    audit_buffered: AtomicU64,
    audit_written: AtomicU64,
    audit_dead_lettered: AtomicU64,
    audit_dropped: DashMap<String, AtomicU64>,
    audit_write_failures: AtomicU64,
    audit_batch_latency: LatencyHistogram,
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str, by: u64) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(by, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(by, Ordering::Relaxed);
}

fn collect(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
            successes: DashMap::new(),
            failures: DashMap::new(),
            attempt_duration_total_ms: DashMap::new(),
            circuit_rejections: DashMap::new(),
            circuit_transitions: DashMap::new(),
            deliveries_by_phase: DashMap::new(),
            audit_buffered: AtomicU64::new(0),
            audit_written: AtomicU64::new(0),
            audit_dead_lettered: AtomicU64::new(0),
            audit_dropped: DashMap::new(),
            audit_write_failures: AtomicU64::new(0),
            audit_batch_latency: LatencyHistogram::new(),
        }
    }

    // ========== Delivery Metrics ==========

    /// Record one delivery attempt and its result.
    pub fn record_attempt(&self, channel: &str, success: bool, duration: Duration) {
        bump(&self.attempts, channel, 1);
        if success {
            bump(&self.successes, channel, 1);
        } else {
            bump(&self.failures, channel, 1);
        }
        bump(
            &self.attempt_duration_total_ms,
            channel,
            duration.as_millis() as u64,
        );
    }

    /// Record a channel skipped because its circuit was open.
    pub fn record_circuit_rejection(&self, channel: &str) {
        bump(&self.circuit_rejections, channel, 1);
    }

    /// Record a breaker state change.
    pub fn record_circuit_transition(&self, channel: &str, to: CircuitState) {
        bump(
            &self.circuit_transitions,
            &format!("{}:{}", channel, to.as_str()),
            1,
        );
    }

    /// Record a completed notification.
    pub fn record_delivery(&self, phase: DeliveryPhase) {
        bump(&self.deliveries_by_phase, phase.as_str(), 1);
    }

    // ========== Audit Metrics ==========

    pub fn record_audit_buffered(&self) {
        self.audit_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_written(&self, count: u64, elapsed: Duration) {
        self.audit_written.fetch_add(count, Ordering::Relaxed);
        self.audit_batch_latency.observe(elapsed);
    }

    pub fn record_audit_write_failure(&self, elapsed: Duration) {
        self.audit_write_failures.fetch_add(1, Ordering::Relaxed);
        self.audit_batch_latency.observe(elapsed);
    }

    pub fn record_audit_dead_lettered(&self, count: u64) {
        self.audit_dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_audit_dropped(&self, reason: &str, count: u64) {
        bump(&self.audit_dropped, reason, count);
    }

    /// Total audit events dropped, across reasons.
    pub fn audit_dropped_total(&self) -> u64 {
        self.audit_dropped
            .iter()
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts: collect(&self.attempts),
            successes: collect(&self.successes),
            failures: collect(&self.failures),
            attempt_duration_total_ms: collect(&self.attempt_duration_total_ms),
            circuit_rejections: collect(&self.circuit_rejections),
            circuit_transitions: collect(&self.circuit_transitions),
            deliveries_by_phase: collect(&self.deliveries_by_phase),
            audit_buffered: self.audit_buffered.load(Ordering::Relaxed),
            audit_written: self.audit_written.load(Ordering::Relaxed),
            audit_dead_lettered: self.audit_dead_lettered.load(Ordering::Relaxed),
            audit_dropped: collect(&self.audit_dropped),
            audit_write_failures: self.audit_write_failures.load(Ordering::Relaxed),
            audit_batch_latency: self.audit_batch_latency.snapshot(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Attempts by channel.
    pub attempts: BTreeMap<String, u64>,
    /// Successful attempts by channel.
    pub successes: BTreeMap<String, u64>,
    /// Failed attempts by channel.
    pub failures: BTreeMap<String, u64>,
    /// Total attempt duration by channel.
    pub attempt_duration_total_ms: BTreeMap<String, u64>,
    /// Channels skipped on an open circuit, by channel.
    pub circuit_rejections: BTreeMap<String, u64>,
    /// Breaker transitions keyed `channel:state`.
    pub circuit_transitions: BTreeMap<String, u64>,
    /// Completed notifications by phase.
    pub deliveries_by_phase: BTreeMap<String, u64>,
    pub audit_buffered: u64,
    pub audit_written: u64,
    pub audit_dead_lettered: u64,
    /// Dropped audit events by reason.
    pub audit_dropped: BTreeMap<String, u64>,
    pub audit_write_failures: u64,
    pub audit_batch_latency: HistogramSnapshot,
}
