//! Delivery records.
//!
//! A [`DeliveryRecord`] aggregates every attempt made for one notification
//! across its channels. Attempts are append-only and a channel's terminal
//! status is set exactly once. The overall [`DeliveryPhase`] is never
//! stored; it is recomputed from the per-channel statuses on demand.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

/// One try against one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub channel: String,
    /// 1-based.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Terminal status of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Delivered,
    Failed,
    CircuitOpen,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// Overall outcome for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPhase {
    /// Every channel delivered.
    Sent,
    /// At least one channel delivered and at least one did not.
    PartiallySent,
    /// No channel delivered.
    Failed,
}

impl DeliveryPhase {
    /// Derive the phase from terminal statuses. An empty set is `Failed`:
    /// nothing reached an operator.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ChannelStatus>,
    {
        let (mut delivered, mut undelivered) = (0usize, 0usize);
        for status in statuses {
            match status {
                ChannelStatus::Delivered => delivered += 1,
                ChannelStatus::Failed | ChannelStatus::CircuitOpen => undelivered += 1,
            }
        }
        match (delivered, undelivered) {
            (0, _) => Self::Failed,
            (_, 0) => Self::Sent,
            _ => Self::PartiallySent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::PartiallySent => "partially_sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempts and terminal status for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    channel: String,
    attempts: Vec<DeliveryAttempt>,
    status: Option<ChannelStatus>,
    /// Why the channel ended without a successful attempt, if it did.
    reason: Option<String>,
}

impl ChannelDelivery {
    pub(crate) fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            attempts: Vec::new(),
            status: None,
            reason: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn attempts(&self) -> &[DeliveryAttempt] {
        &self.attempts
    }

    /// `None` only while delivery is still in flight.
    pub fn status(&self) -> Option<ChannelStatus> {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    /// Append an attempt. Returns false, leaving the record untouched, once
    /// the channel is terminal or if the attempt is out of order.
    pub(crate) fn push_attempt(&mut self, attempt: DeliveryAttempt) -> bool {
        let expected = self.attempts.len() as u32 + 1;
        if self.is_terminal() || attempt.attempt != expected || attempt.channel != self.channel {
            return false;
        }
        self.attempts.push(attempt);
        true
    }

    /// Seal the channel with its terminal status. Only the first call wins.
    pub(crate) fn finish(&mut self, status: ChannelStatus, reason: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = Some(status);
        self.reason = reason;
        true
    }
}

/// Aggregate delivery state for one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    notification_id: String,
    channels: BTreeMap<String, ChannelDelivery>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub(crate) fn new(
        notification_id: impl Into<String>,
        channels: impl IntoIterator<Item = ChannelDelivery>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            channels: channels
                .into_iter()
                .map(|c| (c.channel.clone(), c))
                .collect(),
            started_at,
            completed_at,
        }
    }

    pub fn notification_id(&self) -> &str {
        &self.notification_id
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelDelivery> {
        self.channels.values()
    }

    pub fn channel(&self, channel: &str) -> Option<&ChannelDelivery> {
        self.channels.get(channel)
    }

    pub fn status(&self, channel: &str) -> Option<ChannelStatus> {
        self.channels.get(channel).and_then(|c| c.status)
    }

    pub fn attempts(&self, channel: &str) -> &[DeliveryAttempt] {
        self.channels
            .get(channel)
            .map(|c| c.attempts.as_slice())
            .unwrap_or_default()
    }

    pub fn total_attempts(&self) -> usize {
        self.channels.values().map(|c| c.attempts.len()).sum()
    }

    /// Overall phase, derived from the per-channel terminal statuses.
    /// Channels still in flight count as undelivered.
    pub fn phase(&self) -> DeliveryPhase {
        DeliveryPhase::from_statuses(
            self.channels
                .values()
                .map(|c| c.status.unwrap_or(ChannelStatus::Failed)),
        )
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(channel: &str, n: u32, outcome: AttemptOutcome) -> DeliveryAttempt {
        DeliveryAttempt {
            channel: channel.to_string(),
            attempt: n,
            outcome,
            error: None,
            timestamp: Utc::now(),
            duration: Duration::from_millis(5),
        }
    }

    fn finished(channel: &str, status: ChannelStatus) -> ChannelDelivery {
        let mut delivery = ChannelDelivery::new(channel);
        delivery.finish(status, None);
        delivery
    }

    #[test]
    fn phase_from_statuses() {
        use ChannelStatus::*;
        assert_eq!(DeliveryPhase::from_statuses([Delivered, Delivered]), DeliveryPhase::Sent);
        assert_eq!(
            DeliveryPhase::from_statuses([Delivered, Failed]),
            DeliveryPhase::PartiallySent
        );
        assert_eq!(
            DeliveryPhase::from_statuses([Delivered, CircuitOpen]),
            DeliveryPhase::PartiallySent
        );
        assert_eq!(DeliveryPhase::from_statuses([Failed, CircuitOpen]), DeliveryPhase::Failed);
        assert_eq!(DeliveryPhase::from_statuses([]), DeliveryPhase::Failed);
    }

    #[test]
    fn phase_recomputation_is_idempotent() {
        let now = Utc::now();
        let record = DeliveryRecord::new(
            "n-1",
            [
                finished("console", ChannelStatus::Delivered),
                finished("webhook", ChannelStatus::Failed),
            ],
            now,
            now,
        );
        let before = record.clone();
        let phases: Vec<DeliveryPhase> = (0..10).map(|_| record.phase()).collect();
        assert!(phases.iter().all(|p| *p == DeliveryPhase::PartiallySent));
        assert_eq!(record, before);
    }

    #[test]
    fn attempts_are_append_only_and_ordered() {
        let mut delivery = ChannelDelivery::new("webhook");
        assert!(delivery.push_attempt(attempt("webhook", 1, AttemptOutcome::TransientFailure)));
        // Out of order and foreign-channel attempts are refused.
        assert!(!delivery.push_attempt(attempt("webhook", 3, AttemptOutcome::Success)));
        assert!(!delivery.push_attempt(attempt("console", 2, AttemptOutcome::Success)));
        assert!(delivery.push_attempt(attempt("webhook", 2, AttemptOutcome::Success)));

        assert!(delivery.finish(ChannelStatus::Delivered, None));
        assert!(!delivery.finish(ChannelStatus::Failed, Some("late".into())));
        assert!(!delivery.push_attempt(attempt("webhook", 3, AttemptOutcome::Success)));

        assert_eq!(delivery.status(), Some(ChannelStatus::Delivered));
        assert_eq!(delivery.attempts().len(), 2);
    }

    #[test]
    fn record_serializes_attempt_durations_in_millis() {
        let mut delivery = ChannelDelivery::new("console");
        delivery.push_attempt(attempt("console", 1, AttemptOutcome::Success));
        delivery.finish(ChannelStatus::Delivered, None);
        let now = Utc::now();
        let record = DeliveryRecord::new("n-2", [delivery], now, now);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["channels"]["console"]["attempts"][0]["duration"], 5);
        assert_eq!(json["channels"]["console"]["status"], "delivered");
    }
}
