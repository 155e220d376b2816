//! Notification requests.
//!
//! A [`NotificationRequest`] is created by an external caller and is never
//! mutated by the delivery engine.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority level for notifications.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    /// Informational only.
    Low,
    /// Standard notifications.
    #[default]
    Medium,
    /// Important events, routed to the owning team.
    High,
    /// Requires immediate attention, routed to paging.
    Critical,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationPriority {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" | "info" | "informational" => Ok(Self::Low),
            "medium" | "normal" | "warning" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(crate::Error::validation(format!(
                "unknown notification priority: {other}"
            ))),
        }
    }
}

/// Channels a notification should be delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channels", rename_all = "snake_case")]
pub enum ChannelTarget {
    /// The caller named the channels explicitly.
    Explicit(Vec<String>),
    /// Channels must be resolved from labels and priority.
    Unresolved,
}

/// An operator-facing notification awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    id: String,
    priority: NotificationPriority,
    subject: String,
    body: String,
    target: ChannelTarget,
    labels: BTreeMap<String, String>,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// Start building a request with a generated identifier.
    pub fn builder(subject: impl Into<String>, body: impl Into<String>) -> NotificationRequestBuilder {
        NotificationRequestBuilder {
            id: None,
            priority: NotificationPriority::default(),
            subject: subject.into(),
            body: body.into(),
            channels: Vec::new(),
            labels: BTreeMap::new(),
            correlation_id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> NotificationPriority {
        self.priority
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.target
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy of this request carrying the priority chosen by routing.
    pub(crate) fn with_routed_priority(&self, priority: NotificationPriority) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }
}

/// Builder for [`NotificationRequest`].
#[derive(Debug, Clone)]
pub struct NotificationRequestBuilder {
    id: Option<String>,
    priority: NotificationPriority,
    subject: String,
    body: String,
    channels: Vec<String>,
    labels: BTreeMap<String, String>,
    correlation_id: Option<String>,
}

impl NotificationRequestBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Add an explicit target channel. Without any, routing decides.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn build(self) -> NotificationRequest {
        let target = if self.channels.is_empty() {
            ChannelTarget::Unresolved
        } else {
            let mut seen = HashSet::new();
            let mut channels = self.channels;
            channels.retain(|c| seen.insert(c.clone()));
            ChannelTarget::Explicit(channels)
        };

        NotificationRequest {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            priority: self.priority,
            subject: self.subject,
            body: self.body,
            target,
            labels: self.labels,
            correlation_id: self.correlation_id.filter(|c| !c.trim().is_empty()),
            created_at: Utc::now(),
        }
    }
}
