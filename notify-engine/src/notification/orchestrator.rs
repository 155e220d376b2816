//! Delivery orchestration.
//!
//! For one notification, every resolved channel runs in its own task:
//! circuit breaker gate, then the retry loop around the channel's
//! deliverer. Channels never wait on each other. The caller gets a
//! [`DeliveryRecord`] once every channel is terminal or the orchestration
//! deadline has passed.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::{ChannelDeliverer, ChannelRegistry, DeliveryError};
use super::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use super::classify::classify;
use super::record::{AttemptOutcome, ChannelDelivery, ChannelStatus, DeliveryAttempt, DeliveryRecord};
use super::request::NotificationRequest;
use super::retry::RetryPolicy;
use crate::audit::{AuditEvent, AuditHandle};
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

const REASON_DEADLINE: &str = "orchestration deadline exceeded";

/// Time bounds for deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bound on a single deliverer call. Exceeding it is a transient failure.
    pub channel_timeout_secs: u64,
    /// Wall-clock cap on one notification, retries included.
    pub orchestration_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            channel_timeout_secs: 30,
            orchestration_timeout_secs: 15 * 60,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_timeout_secs == 0 || self.orchestration_timeout_secs == 0 {
            return Err(Error::config("delivery timeouts must be positive"));
        }
        Ok(())
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn orchestration_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration_timeout_secs)
    }
}

/// Drives retries and circuit breaking across a notification's channels.
pub struct DeliveryOrchestrator {
    channels: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    config: DeliveryConfig,
    metrics: Arc<MetricsCollector>,
    audit: Option<AuditHandle>,
}

impl DeliveryOrchestrator {
    pub fn new(
        channels: Arc<ChannelRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        config: DeliveryConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            channels,
            breakers,
            retry,
            config,
            metrics,
            audit: None,
        }
    }

    /// Emit audit events through this handle.
    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Deliver `request` to every channel in `channels` concurrently.
    ///
    /// Never fails: per-channel failures end up in the returned record.
    pub async fn deliver(&self, request: &NotificationRequest, channels: &[String]) -> DeliveryRecord {
        let started_at = Utc::now();
        let request = Arc::new(request.clone());
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut slots = Vec::with_capacity(channels.len());
        let mut seen = BTreeSet::new();

        for channel in channels {
            if !seen.insert(channel.as_str()) {
                continue;
            }
            let slot = Arc::new(Mutex::new(ChannelDelivery::new(channel.clone())));
            slots.push(slot.clone());

            let Some(deliverer) = self.channels.get(channel) else {
                warn!(
                    notification_id = request.id(),
                    channel = %channel,
                    "No deliverer registered for channel"
                );
                slot.lock()
                    .finish(ChannelStatus::Failed, Some("no deliverer registered".to_string()));
                continue;
            };

            let task = ChannelTask {
                channel: channel.clone(),
                request: request.clone(),
                deliverer,
                breaker: self.breakers.get(channel),
                retry: self.retry.clone(),
                call_timeout: self.config.channel_timeout(),
                metrics: self.metrics.clone(),
                audit: self.audit.clone(),
                cancel: cancel.clone(),
                slot,
            };
            tasks.spawn(task.run());
        }

        let deadline = Instant::now() + self.config.orchestration_timeout();
        let finished = tokio::time::timeout_at(deadline, join_all(&mut tasks)).await;
        let deadline_hit = finished.is_err();
        if deadline_hit {
            warn!(
                notification_id = request.id(),
                timeout_secs = self.config.orchestration_timeout_secs,
                "Orchestration deadline exceeded, cancelling pending channels"
            );
            cancel.cancel();
            // Every suspension point in a channel task observes the token.
            join_all(&mut tasks).await;
        }

        let reason = if deadline_hit {
            REASON_DEADLINE
        } else {
            "delivery task ended without a result"
        };
        let deliveries: Vec<ChannelDelivery> = slots
            .iter()
            .map(|slot| {
                let mut delivery = slot.lock();
                delivery.finish(ChannelStatus::Failed, Some(reason.to_string()));
                delivery.clone()
            })
            .collect();

        let record = DeliveryRecord::new(request.id(), deliveries, started_at, Utc::now());
        let phase = record.phase();
        self.metrics.record_delivery(phase);
        if let Some(audit) = &self.audit {
            let _ = audit.store_audit(AuditEvent::completed(&request, &record));
        }

        info!(
            notification_id = request.id(),
            phase = %phase,
            channels = record.channels().count(),
            attempts = record.total_attempts(),
            "Notification delivery completed"
        );
        record
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Channel delivery task failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State owned by one channel's delivery task.
struct ChannelTask {
    channel: String,
    request: Arc<NotificationRequest>,
    deliverer: Arc<dyn ChannelDeliverer>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    call_timeout: Duration,
    metrics: Arc<MetricsCollector>,
    audit: Option<AuditHandle>,
    cancel: CancellationToken,
    slot: Arc<Mutex<ChannelDelivery>>,
}

impl ChannelTask {
    async fn run(self) {
        if !self.breaker.allow_request() {
            debug!(
                notification_id = self.request.id(),
                channel = %self.channel,
                "Circuit open, skipping channel"
            );
            self.metrics.record_circuit_rejection(&self.channel);
            self.finish(ChannelStatus::CircuitOpen, Some("circuit open".to_string()));
            self.emit(AuditEvent::circuit_open(&self.request, &self.channel));
            return;
        }

        let mut attempt = 1;
        loop {
            let timestamp = Utc::now();
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // Cut off mid-call by the orchestration deadline.
                    self.breaker.record_failure();
                    self.record_attempt(
                        attempt,
                        AttemptOutcome::TransientFailure,
                        Some(REASON_DEADLINE.to_string()),
                        timestamp,
                        started.elapsed(),
                    );
                    return;
                }
                result = tokio::time::timeout(self.call_timeout, self.call_deliverer()) => {
                    result.unwrap_or(Err(DeliveryError::Timeout(self.call_timeout)))
                }
            };
            let duration = started.elapsed();

            let error = match result {
                Ok(()) => {
                    self.breaker.record_success();
                    self.record_attempt(attempt, AttemptOutcome::Success, None, timestamp, duration);
                    self.finish(ChannelStatus::Delivered, None);
                    debug!(
                        notification_id = self.request.id(),
                        channel = %self.channel,
                        attempt,
                        "Channel delivered"
                    );
                    return;
                }
                Err(error) => error,
            };

            self.breaker.record_failure();
            let class = classify(&error);
            let outcome = if class.is_retryable() {
                AttemptOutcome::TransientFailure
            } else {
                AttemptOutcome::PermanentFailure
            };
            self.record_attempt(attempt, outcome, Some(error.to_string()), timestamp, duration);

            if !self.retry.should_retry(attempt, &error) {
                warn!(
                    notification_id = self.request.id(),
                    channel = %self.channel,
                    attempt,
                    class = ?class,
                    error = %error,
                    "Channel delivery failed"
                );
                self.finish(ChannelStatus::Failed, Some(error.to_string()));
                return;
            }

            let delay = self.retry.next_delay(attempt - 1);
            debug!(
                notification_id = self.request.id(),
                channel = %self.channel,
                attempt,
                error = %error,
                "Delivery attempt failed, retrying in {:?}",
                delay
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            // Other notifications may have tripped the breaker meanwhile.
            if !self.breaker.allow_request() {
                self.metrics.record_circuit_rejection(&self.channel);
                self.finish(
                    ChannelStatus::Failed,
                    Some(format!("circuit opened after {} attempts", attempt - 1)),
                );
                return;
            }
        }
    }

    /// One deliverer call. A panicking deliverer is a failed attempt, so the
    /// breaker always sees an outcome and a half-open trial slot is released.
    async fn call_deliverer(&self) -> std::result::Result<(), DeliveryError> {
        match AssertUnwindSafe(self.deliverer.deliver(&self.request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    notification_id = self.request.id(),
                    channel = %self.channel,
                    panic = %message,
                    "Channel deliverer panicked"
                );
                Err(DeliveryError::Other(format!("deliverer panicked: {message}")))
            }
        }
    }

    fn record_attempt(
        &self,
        attempt: u32,
        outcome: AttemptOutcome,
        error: Option<String>,
        timestamp: chrono::DateTime<Utc>,
        duration: Duration,
    ) {
        let attempt = DeliveryAttempt {
            channel: self.channel.clone(),
            attempt,
            outcome,
            error,
            timestamp,
            duration,
        };
        self.metrics
            .record_attempt(&self.channel, outcome == AttemptOutcome::Success, duration);
        let event = AuditEvent::attempt(&self.request, &attempt);
        if self.slot.lock().push_attempt(attempt) {
            self.emit(event);
        }
    }

    fn finish(&self, status: ChannelStatus, reason: Option<String>) {
        self.slot.lock().finish(status, reason);
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            // Rejections are counted by the pipeline; delivery never waits on audit.
            let _ = audit.store_audit(event);
        }
    }
}
