//! Asynchronous, batched audit pipeline.
//!
//! Producers enqueue through a cloneable [`AuditHandle`] without waiting.
//! A single background task drains the bounded queue and writes batches
//! when either the batch-size threshold is reached or the flush interval
//! ticks, whichever comes first. Batches the store keeps refusing go to the
//! dead-letter queue; if that fails too they are dropped and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::AuditEvent;
use super::store::{AuditStore, DeadLetterQueue, HttpAuditStoreConfig};
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// Drop reason: the queue was full at enqueue time.
pub const DROP_BUFFER_FULL: &str = "buffer_full";
/// Drop reason: the pipeline had already shut down.
pub const DROP_CLOSED: &str = "closed";
/// Drop reason: both the store and the dead-letter queue failed.
pub const DROP_DEAD_LETTER_FAILED: &str = "dead_letter_failed";

/// Configuration for the audit pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Capacity of the in-memory queue.
    pub buffer_size: usize,
    /// Events per store write.
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Store retries after the first failed write.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub retry_backoff_ms: u64,
    /// Bound on a single store or dead-letter call.
    pub write_timeout_ms: u64,
    /// HTTP audit store. Events are kept in memory when unset.
    pub endpoint: Option<HttpAuditStoreConfig>,
    /// JSON-lines dead-letter file. Kept in memory when unset.
    pub dead_letter_path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 10,
            flush_interval_ms: 100,
            max_retries: 3,
            retry_backoff_ms: 50,
            write_timeout_ms: 5_000,
            endpoint: None,
            dead_letter_path: None,
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::config("audit.buffer_size must be at least 1"));
        }
        if self.batch_size == 0 || self.batch_size > self.buffer_size {
            return Err(Error::config(
                "audit.batch_size must be between 1 and audit.buffer_size",
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::config("audit.flush_interval_ms must be positive"));
        }
        if self.write_timeout_ms == 0 {
            return Err(Error::config("audit.write_timeout_ms must be positive"));
        }
        Ok(())
    }

    fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    fn retry_backoff(&self, retry: u32) -> Duration {
        let multiplier = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(multiplier))
    }
}

/// Why an event was not enqueued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit buffer full")]
    BufferFull,
    #[error("audit pipeline closed")]
    Closed,
}

#[derive(Debug, Default)]
struct AuditStats {
    buffered: AtomicU64,
    written: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

/// Audit pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStatsSnapshot {
    pub buffered: u64,
    pub written: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub write_failures: u64,
}

impl AuditStats {
    fn snapshot(&self) -> AuditStatsSnapshot {
        AuditStatsSnapshot {
            buffered: self.buffered.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable producer side of the pipeline.
#[derive(Clone)]
pub struct AuditHandle {
    sender: mpsc::Sender<AuditEvent>,
    stats: Arc<AuditStats>,
    metrics: Arc<MetricsCollector>,
}

impl AuditHandle {
    /// Enqueue an event without waiting. A rejected event is counted as
    /// dropped before the error is returned.
    pub fn store_audit(&self, event: AuditEvent) -> std::result::Result<(), AuditError> {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.stats.buffered.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_audit_buffered();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.drop_one(&event, DROP_BUFFER_FULL);
                Err(AuditError::BufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.drop_one(&event, DROP_CLOSED);
                Err(AuditError::Closed)
            }
        }
    }

    fn drop_one(&self, event: &AuditEvent, reason: &'static str) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_audit_dropped(reason, 1);
        warn!(
            event_type = %event.event_type,
            resource_id = %event.resource_id,
            reason,
            "Audit event dropped"
        );
    }

    pub fn stats(&self) -> AuditStatsSnapshot {
        self.stats.snapshot()
    }
}

struct Flusher {
    store: Arc<dyn AuditStore>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    config: AuditConfig,
    stats: Arc<AuditStats>,
    metrics: Arc<MetricsCollector>,
}

impl Flusher {
    async fn run(
        self,
        mut receiver: mpsc::Receiver<AuditEvent>,
        cancel: CancellationToken,
    ) {
        let batch_size = self.config.batch_size;
        let mut buffer = Vec::with_capacity(batch_size);
        let mut flush_timer = interval(self.config.flush_interval());
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Stop accepting, then drain what producers already queued.
                    receiver.close();
                    while let Some(event) = receiver.recv().await {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(std::mem::take(&mut buffer)).await;
                        }
                    }
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                    break;
                }

                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            buffer.push(event);
                            if buffer.len() >= batch_size {
                                self.flush(std::mem::take(&mut buffer)).await;
                                buffer = Vec::with_capacity(batch_size);
                            }
                        }
                        None => {
                            // Every handle dropped.
                            if !buffer.is_empty() {
                                self.flush(std::mem::take(&mut buffer)).await;
                            }
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => {
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                        buffer = Vec::with_capacity(batch_size);
                    }
                }
            }
        }

        debug!("Audit flush loop stopped");
    }

    /// Write one batch: the initial write plus `max_retries` retries, then
    /// the dead-letter queue, then drop.
    async fn flush(&self, batch: Vec<AuditEvent>) {
        let count = batch.len() as u64;
        let timeout = Duration::from_millis(self.config.write_timeout_ms);

        let mut retry = 0;
        loop {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, self.store.write_batch(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(Error::audit(format!("audit write timed out after {timeout:?}"))),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    self.stats.written.fetch_add(count, Ordering::Relaxed);
                    self.metrics.record_audit_written(count, elapsed);
                    debug!(count, "Flushed audit batch");
                    return;
                }
                Err(e) => {
                    self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_audit_write_failure(elapsed);
                    if retry >= self.config.max_retries {
                        warn!(count, error = %e, "Audit batch write failed, retries exhausted");
                        break;
                    }
                    let delay = self.config.retry_backoff(retry);
                    retry += 1;
                    debug!(count, retry, error = %e, "Audit batch write failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let pushed = match tokio::time::timeout(timeout, self.dead_letter.push(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(Error::audit("dead-letter push timed out")),
        };
        match pushed {
            Ok(()) => {
                self.stats.dead_lettered.fetch_add(count, Ordering::Relaxed);
                self.metrics.record_audit_dead_lettered(count);
                warn!(count, "Audit batch moved to dead-letter queue");
            }
            Err(e) => {
                self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                self.metrics.record_audit_dropped(DROP_DEAD_LETTER_FAILED, count);
                error!(count, error = %e, "Audit batch dropped, dead-letter push failed");
            }
        }
    }
}

/// Owner of the background flush task.
pub struct AuditPipeline {
    handle: AuditHandle,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuditPipeline {
    /// Start the pipeline. Must be called from within a tokio runtime.
    pub fn new(
        config: AuditConfig,
        store: Arc<dyn AuditStore>,
        dead_letter: Arc<dyn DeadLetterQueue>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.buffer_size);
        let stats = Arc::new(AuditStats::default());
        let cancel = CancellationToken::new();

        let flusher = Flusher {
            store,
            dead_letter,
            config: config.clone(),
            stats: stats.clone(),
            metrics: metrics.clone(),
        };
        let task = tokio::spawn(flusher.run(receiver, cancel.clone()));

        info!(
            buffer_size = config.buffer_size,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "Audit pipeline started"
        );

        Ok(Self {
            handle: AuditHandle {
                sender,
                stats,
                metrics,
            },
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Producer handle for orchestrators.
    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    pub fn store_audit(&self, event: AuditEvent) -> std::result::Result<(), AuditError> {
        self.handle.store_audit(event)
    }

    pub fn stats(&self) -> AuditStatsSnapshot {
        self.handle.stats()
    }

    /// Stop accepting events, flush everything already queued and wait for
    /// the background task. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Audit flush task failed");
            }
            let stats = self.stats();
            info!(
                written = stats.written,
                dead_lettered = stats.dead_lettered,
                dropped = stats.dropped,
                "Audit pipeline stopped"
            );
        }
    }
}

impl Drop for AuditPipeline {
    fn drop(&mut self) {
        // The detached task still drains and flushes on its own.
        self.cancel.cancel();
    }
}
