//! Notification delivery.
//!
//! Routing picks the channels for a request, the orchestrator delivers to
//! each of them concurrently behind a per-channel circuit breaker and retry
//! policy, and the outcome is aggregated into a [`DeliveryRecord`].
//!
//! # Example
//!
//! ```ignore
//! use notify_engine::notification::{NotificationRequest, NotificationPriority, NotificationService};
//!
//! let service = NotificationService::from_config(&config)?;
//! let request = NotificationRequest::builder("Escalation", "pod crashlooping")
//!     .priority(NotificationPriority::High)
//!     .label("team", "payments")
//!     .build();
//! let record = service.notify(request).await;
//! ```

pub mod channels;
mod circuit;
mod classify;
mod orchestrator;
mod record;
mod request;
mod retry;
mod routing;
mod service;

pub use channels::{
    ChannelConfig, ChannelDeliverer, ChannelRegistry, ConsoleChannel, ConsoleConfig, DeliveryError,
    EmailChannel, EmailConfig, WebhookAuth, WebhookChannel, WebhookConfig,
};
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use classify::{ErrorClass, classify, classify_http_status, classify_smtp_code};
pub use orchestrator::{DeliveryConfig, DeliveryOrchestrator};
pub use record::{
    AttemptOutcome, ChannelDelivery, ChannelStatus, DeliveryAttempt, DeliveryPhase, DeliveryRecord,
};
pub use request::{
    ChannelTarget, NotificationPriority, NotificationRequest, NotificationRequestBuilder,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use routing::{
    LabelMatcherConfig, RouteDecision, RouteSource, RoutingConfig, RoutingResolver, RoutingRule,
    SEVERITY_LABEL, SeverityRoute,
};
pub use service::{DeliverySummary, NotificationService, NotificationStats};
