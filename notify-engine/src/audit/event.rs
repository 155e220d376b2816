//! Audit events.
//!
//! An [`AuditEvent`] is a one-way projection of a delivery attempt or a
//! phase change. Events are produced by the orchestrator and owned by the
//! audit pipeline until they are written or dead-lettered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::notification::{DeliveryAttempt, DeliveryRecord, NotificationRequest};

/// Event type of per-attempt events.
pub const EVENT_ATTEMPT: &str = "notification.attempt";
/// Event type of channels skipped because their circuit was open.
pub const EVENT_CIRCUIT_OPEN: &str = "notification.circuit_open";
/// Event type emitted once every channel is terminal.
pub const EVENT_COMPLETED: &str = "notification.completed";

/// An audit-shaped record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: String,
    pub outcome: String,
    /// Correlation id of the originating request, or the notification id.
    pub correlation_id: String,
    /// True when the request carried no correlation id and
    /// `correlation_id` is the notification id.
    pub correlation_fallback: bool,
    /// Notification id.
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    fn new(
        request: &NotificationRequest,
        event_type: &str,
        outcome: &str,
        payload: serde_json::Value,
    ) -> Self {
        let (correlation_id, correlation_fallback) = match request.correlation_id() {
            Some(id) => (id.to_string(), false),
            None => (request.id().to_string(), true),
        };
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            outcome: outcome.to_string(),
            correlation_id,
            correlation_fallback,
            resource_id: request.id().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// One event per delivery attempt.
    pub fn attempt(request: &NotificationRequest, attempt: &DeliveryAttempt) -> Self {
        Self::new(
            request,
            EVENT_ATTEMPT,
            attempt.outcome.as_str(),
            json!({
                "channel": attempt.channel,
                "attempt": attempt.attempt,
                "error": attempt.error,
                "duration_ms": attempt.duration.as_millis() as u64,
                "attempted_at": attempt.timestamp,
            }),
        )
    }

    /// A channel rejected by its open circuit; no call was made.
    pub fn circuit_open(request: &NotificationRequest, channel: &str) -> Self {
        Self::new(
            request,
            EVENT_CIRCUIT_OPEN,
            "circuit_open",
            json!({ "channel": channel }),
        )
    }

    /// Final outcome of a notification across all its channels.
    pub fn completed(request: &NotificationRequest, record: &DeliveryRecord) -> Self {
        let channels: serde_json::Map<String, serde_json::Value> = record
            .channels()
            .map(|c| {
                (
                    c.channel().to_string(),
                    json!({
                        "status": c.status().map(|s| s.as_str()),
                        "attempts": c.attempts().len(),
                        "reason": c.reason(),
                    }),
                )
            })
            .collect();
        let phase = record.phase();

        Self::new(
            request,
            EVENT_COMPLETED,
            phase.as_str(),
            json!({
                "phase": phase,
                "priority": request.priority(),
                "channels": channels,
                "started_at": record.started_at(),
                "completed_at": record.completed_at(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notification::AttemptOutcome;

    fn attempt() -> DeliveryAttempt {
        DeliveryAttempt {
            channel: "webhook".into(),
            attempt: 2,
            outcome: AttemptOutcome::TransientFailure,
            error: Some("HTTP 503: busy".into()),
            timestamp: Utc::now(),
            duration: Duration::from_millis(42),
        }
    }

    #[test]
    fn correlation_id_is_taken_from_request() {
        let request = NotificationRequest::builder("s", "b")
            .correlation_id("incident-7")
            .build();
        let event = AuditEvent::attempt(&request, &attempt());

        assert_eq!(event.correlation_id, "incident-7");
        assert!(!event.correlation_fallback);
        assert_eq!(event.resource_id, request.id());
        assert_eq!(event.outcome, "transient_failure");
        assert_eq!(event.payload["attempt"], 2);
        assert_eq!(event.payload["duration_ms"], 42);
    }

    #[test]
    fn missing_correlation_falls_back_to_notification_id_and_is_flagged() {
        let request = NotificationRequest::builder("s", "b").id("n-42").build();
        let event = AuditEvent::circuit_open(&request, "webhook");

        assert_eq!(event.correlation_id, "n-42");
        assert!(event.correlation_fallback);
        assert_eq!(event.event_type, EVENT_CIRCUIT_OPEN);
    }

    #[test]
    fn event_ids_are_unique() {
        let request = NotificationRequest::builder("s", "b").build();
        let a = AuditEvent::circuit_open(&request, "webhook");
        let b = AuditEvent::circuit_open(&request, "webhook");
        assert_ne!(a.event_id, b.event_id);
    }
}
