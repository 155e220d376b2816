//! Notification service.
//!
//! The NotificationService is responsible for:
//! - Resolving channels for each request through the routing rules
//! - Running delivery with retries and per-channel circuit breakers
//! - Feeding the audit pipeline and broadcasting delivery summaries

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::channels::ChannelRegistry;
use super::circuit::{CircuitBreakerRegistry, CircuitSnapshot};
use super::orchestrator::DeliveryOrchestrator;
use super::record::{ChannelStatus, DeliveryPhase, DeliveryRecord};
use super::request::NotificationRequest;
use super::retry::RetryPolicy;
use super::routing::{RouteSource, RoutingResolver};
use crate::audit::{
    AuditPipeline, AuditStatsSnapshot, AuditStore, DeadLetterQueue, FileDeadLetterQueue,
    HttpAuditStore, InMemoryAuditStore,
};
use crate::config::EngineConfig;
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

const SUMMARY_CHANNEL_CAPACITY: usize = 256;

/// Broadcast once a notification reaches its final phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub notification_id: String,
    pub correlation_id: Option<String>,
    pub phase: DeliveryPhase,
    pub route: RouteSource,
    /// Terminal status by channel.
    pub channels: BTreeMap<String, ChannelStatus>,
    pub completed_at: DateTime<Utc>,
}

/// Statistics about the notification service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationStats {
    /// Number of registered channels.
    pub channel_count: usize,
    /// Circuit breakers created so far, by channel.
    pub circuit_breakers: BTreeMap<String, CircuitSnapshot>,
    pub audit: AuditStatsSnapshot,
}

/// Entry point for delivering notifications.
pub struct NotificationService {
    resolver: RoutingResolver,
    orchestrator: DeliveryOrchestrator,
    audit: AuditPipeline,
    metrics: Arc<MetricsCollector>,
    event_tx: broadcast::Sender<DeliverySummary>,
}

impl NotificationService {
    /// Build the service and every collaborator described by `config`.
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let channels = ChannelRegistry::from_configs(&config.channels)?;

        let store: Arc<dyn AuditStore> = match &config.audit.endpoint {
            Some(endpoint) => Arc::new(HttpAuditStore::new(endpoint.clone())?),
            None => {
                warn!("No audit endpoint configured, audit events are kept in memory");
                Arc::new(InMemoryAuditStore::new())
            }
        };
        let dead_letter: Arc<dyn DeadLetterQueue> = match &config.audit.dead_letter_path {
            Some(path) => Arc::new(FileDeadLetterQueue::new(path)),
            None => Arc::new(InMemoryAuditStore::new()),
        };

        Self::with_components(config, channels, store, dead_letter)
    }

    /// Build the service around explicit channel and audit collaborators.
    pub fn with_components(
        config: &EngineConfig,
        channels: ChannelRegistry,
        store: Arc<dyn AuditStore>,
        dead_letter: Arc<dyn DeadLetterQueue>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let resolver =
            RoutingResolver::new(config.routing.clone())?.with_known_channels(channels.ids())?;
        let breakers = Arc::new(CircuitBreakerRegistry::with_metrics(
            config.circuit_breaker.clone(),
            metrics.clone(),
        ));
        let audit = AuditPipeline::new(config.audit.clone(), store, dead_letter, metrics.clone())?;
        let orchestrator = DeliveryOrchestrator::new(
            Arc::new(channels),
            breakers,
            RetryPolicy::new(config.retry.clone()),
            config.delivery.clone(),
            metrics.clone(),
        )
        .with_audit(audit.handle());
        let (event_tx, _) = broadcast::channel(SUMMARY_CHANNEL_CAPACITY);

        info!(
            channels = ?orchestrator.channels().ids(),
            "Notification service initialized"
        );

        Ok(Self {
            resolver,
            orchestrator,
            audit,
            metrics,
            event_tx,
        })
    }

    /// Route and deliver a notification, waiting until every channel is
    /// terminal. Expected failures are reported in the record, never as
    /// an error.
    pub async fn notify(&self, request: NotificationRequest) -> DeliveryRecord {
        let route = self.resolver.resolve(&request);
        let request = if route.priority != request.priority() {
            request.with_routed_priority(route.priority)
        } else {
            request
        };

        let record = self.orchestrator.deliver(&request, &route.channels).await;

        let summary = DeliverySummary {
            notification_id: record.notification_id().to_string(),
            correlation_id: request.correlation_id().map(str::to_string),
            phase: record.phase(),
            route: route.source,
            channels: record
                .channels()
                .filter_map(|c| c.status().map(|s| (c.channel().to_string(), s)))
                .collect(),
            completed_at: record.completed_at(),
        };
        // No subscribers is fine.
        let _ = self.event_tx.send(summary);

        record
    }

    /// Subscribe to delivery summaries.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliverySummary> {
        self.event_tx.subscribe()
    }

    /// Send a probe notification through one channel, bypassing retries and
    /// the circuit breaker.
    pub async fn test_channel(&self, channel: &str) -> Result<()> {
        let deliverer = self
            .orchestrator
            .channels()
            .get(channel)
            .ok_or_else(|| Error::not_found("Channel", channel))?;
        deliverer.test().await?;
        info!(channel, "Channel test succeeded");
        Ok(())
    }

    /// Force a channel's circuit breaker back to closed.
    pub fn reset_circuit(&self, channel: &str) -> Result<()> {
        self.orchestrator.breakers().reset(channel)?;
        info!(channel, "Circuit breaker reset by operator");
        Ok(())
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            channel_count: self.orchestrator.channels().len(),
            circuit_breakers: self.orchestrator.breakers().snapshot(),
            audit: self.audit.stats(),
        }
    }

    /// Flush the audit pipeline and stop it.
    pub async fn shutdown(&self) {
        info!("Stopping notification service");
        self.audit.shutdown().await;
        info!("Notification service stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::notification::{ChannelDeliverer, DeliveryError, NotificationPriority};

    struct TestChannel {
        fail: bool,
        attempts: Arc<AtomicU32>,
        last_priority: parking_lot::Mutex<Option<NotificationPriority>>,
    }

    impl TestChannel {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                attempts: Arc::new(AtomicU32::new(0)),
                last_priority: parking_lot::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChannelDeliverer for TestChannel {
        fn channel_type(&self) -> &'static str {
            "test"
        }

        async fn deliver(&self, request: &NotificationRequest) -> std::result::Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            *self.last_priority.lock() = Some(request.priority());
            if self.fail {
                Err(DeliveryError::Rejected("forced failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn service(channels: Vec<(&str, Arc<TestChannel>)>, config: EngineConfig) -> NotificationService {
        let mut registry = ChannelRegistry::new();
        for (id, channel) in channels {
            registry.register(id, channel).unwrap();
        }
        NotificationService::with_components(
            &config,
            registry,
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(InMemoryAuditStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn notify_routes_and_broadcasts_summary() {
        let console = TestChannel::new(false);
        let service = service(vec![("console", console.clone())], EngineConfig::default());
        let mut rx = service.subscribe();

        let request = NotificationRequest::builder("Status", "remediation finished")
            .priority(NotificationPriority::Low)
            .correlation_id("incident-1")
            .build();
        let record = service.notify(request).await;

        assert_eq!(record.phase(), DeliveryPhase::Sent);
        assert_eq!(console.attempts.load(Ordering::SeqCst), 1);

        let summary = rx.recv().await.unwrap();
        assert_eq!(summary.notification_id, record.notification_id());
        assert_eq!(summary.correlation_id.as_deref(), Some("incident-1"));
        assert_eq!(summary.route, RouteSource::Severity(NotificationPriority::Low));
        assert_eq!(summary.channels["console"], ChannelStatus::Delivered);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn rule_priority_override_reaches_the_channel() {
        let chat = TestChannel::new(false);
        let mut config = EngineConfig::default();
        config.routing.rules.push(crate::notification::RoutingRule {
            name: "approvals".into(),
            matchers: vec![crate::notification::LabelMatcherConfig::Exists {
                label: "approval".into(),
            }],
            channels: vec!["chat".into()],
            priority: Some(NotificationPriority::Critical),
            group_wait_secs: 0,
        });
        config.routing.default_channel = "chat".into();
        let service = service(vec![("chat", chat.clone())], config);

        let request = NotificationRequest::builder("Approve?", "restart deployment")
            .label("approval", "required")
            .build();
        service.notify(request).await;

        assert_eq!(*chat.last_priority.lock(), Some(NotificationPriority::Critical));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn stats_report_channels_breakers_and_audit() {
        let console = TestChannel::new(false);
        let webhook = TestChannel::new(true);
        let service = service(
            vec![("console", console), ("webhook", webhook)],
            EngineConfig::default(),
        );

        let request = NotificationRequest::builder("s", "b")
            .channel("console")
            .channel("webhook")
            .build();
        let record = service.notify(request).await;
        assert_eq!(record.phase(), DeliveryPhase::PartiallySent);

        service.shutdown().await;
        let stats = service.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.circuit_breakers.len(), 2);
        assert_eq!(stats.circuit_breakers["webhook"].consecutive_failures, 1);
        // Two attempt events plus one completion event.
        assert_eq!(stats.audit.written, 3);
        assert_eq!(stats.audit.dropped, 0);
    }

    #[tokio::test]
    async fn test_and_reset_unknown_channel_are_not_found() {
        let service = service(vec![("console", TestChannel::new(false))], EngineConfig::default());
        assert!(matches!(
            service.test_channel("missing").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            service.reset_circuit("missing"),
            Err(Error::NotFound { .. })
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn critical_alert_without_pager_reaches_default_channel() {
        let console = TestChannel::new(false);
        let service = service(vec![("console", console.clone())], EngineConfig::default());

        let request = NotificationRequest::builder("Outage", "api down")
            .priority(NotificationPriority::Critical)
            .build();
        let record = service.notify(request).await;

        assert_eq!(record.phase(), DeliveryPhase::Sent);
        assert_eq!(record.status("console"), Some(ChannelStatus::Delivered));
        assert!(record.status("pager").is_none());
        assert_eq!(console.attempts.load(Ordering::SeqCst), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn default_channel_must_be_registered() {
        let mut registry = ChannelRegistry::new();
        registry.register("webhook", TestChannel::new(false)).unwrap();
        let result = NotificationService::with_components(
            &EngineConfig::default(),
            registry,
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(InMemoryAuditStore::new()),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn failing_channel_test_surfaces_delivery_error() {
        let webhook = TestChannel::new(true);
        let service = service(
            vec![("console", TestChannel::new(false)), ("webhook", webhook)],
            EngineConfig::default(),
        );
        assert!(matches!(
            service.test_channel("webhook").await,
            Err(Error::Delivery(DeliveryError::Rejected(_)))
        ));
        service.shutdown().await;
    }
}
