//! Notification channels.
//!
//! This module provides the adapters that actually put a notification in
//! front of an operator:
//! - Console (line-oriented output)
//! - Generic webhooks (HTTP POST/PUT, e.g. chat incoming webhooks)
//! - Email (SMTP)
//!
//! Channels are side-effect-only. Retries, timeouts and circuit breaking are
//! applied by the orchestrator around [`ChannelDeliverer::deliver`].

mod console;
mod email;
mod webhook;

pub use console::{ConsoleChannel, ConsoleConfig};
pub use email::{EmailChannel, EmailConfig};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::request::{NotificationPriority, NotificationRequest};
use crate::{Error, Result};

/// A failed delivery attempt, as reported by a channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The call did not complete within the per-channel timeout.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The remote endpoint could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The HTTP endpoint answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The SMTP server answered with a non-success reply.
    #[error("SMTP {code}: {message}")]
    Smtp { code: u16, message: String },

    /// The notification can never be accepted by this channel as configured.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

/// A delivery adapter for one channel type.
#[async_trait]
pub trait ChannelDeliverer: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Deliver a notification once. No retries.
    async fn deliver(&self, request: &NotificationRequest) -> std::result::Result<(), DeliveryError>;

    /// Send a synthetic probe notification through this channel.
    async fn test(&self) -> std::result::Result<(), DeliveryError> {
        let probe = NotificationRequest::builder(
            "Notification channel test",
            "This is a test notification.",
        )
        .priority(NotificationPriority::Low)
        .label("probe", "true")
        .build();
        self.deliver(&probe).await
    }
}

/// Channel configuration wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Console(ConsoleConfig),
    Webhook(WebhookConfig),
    Email(EmailConfig),
}

impl ChannelConfig {
    /// Get the channel type name.
    pub fn channel_type(&self) -> &'static str {
        match self {
            Self::Console(_) => "console",
            Self::Webhook(_) => "webhook",
            Self::Email(_) => "email",
        }
    }

    /// Channel identifier that routing refers to.
    pub fn id(&self) -> &str {
        match self {
            Self::Console(c) => &c.id,
            Self::Webhook(c) => &c.id,
            Self::Email(c) => &c.id,
        }
    }

    /// Check if the channel is enabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Console(c) => c.enabled,
            Self::Webhook(c) => c.enabled,
            Self::Email(c) => c.enabled,
        }
    }

    fn build(&self) -> Result<Arc<dyn ChannelDeliverer>> {
        Ok(match self {
            Self::Console(c) => Arc::new(ConsoleChannel::stdout(c.clone())),
            Self::Webhook(c) => Arc::new(WebhookChannel::new(c.clone())?),
            Self::Email(c) => Arc::new(EmailChannel::new(c.clone())?),
        })
    }
}

/// Deliverers keyed by channel identifier.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ChannelDeliverer>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build deliverers for every enabled channel configuration.
    pub fn from_configs(configs: &[ChannelConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.is_enabled()) {
            registry.register(config.id(), config.build()?)?;
            info!(
                channel = config.id(),
                channel_type = config.channel_type(),
                "Initialized notification channel"
            );
        }
        Ok(registry)
    }

    /// Register a deliverer. Identifiers must be unique and non-empty.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        deliverer: Arc<dyn ChannelDeliverer>,
    ) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::config("channel id must not be empty"));
        }
        if self.channels.contains_key(&id) {
            return Err(Error::config(format!("duplicate channel id: {id}")));
        }
        self.channels.insert(id, deliverer);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelDeliverer>> {
        self.channels.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Registered channel identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
