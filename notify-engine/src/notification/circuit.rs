//! Per-channel circuit breakers.
//!
//! Each channel gets its own breaker guarded by its own lock, so a failing
//! webhook never contends with, or trips, the console or email breakers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

/// Configuration for circuit breakers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long an open circuit rejects requests, in seconds.
    pub open_timeout_secs: u64,
    /// Probe requests admitted concurrently while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 60,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(crate::Error::config(
                "circuit breaker thresholds must be at least 1",
            ));
        }
        if self.half_open_max_probes == 0 {
            return Err(crate::Error::config(
                "circuit_breaker.half_open_max_probes must be at least 1",
            ));
        }
        Ok(())
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing, rejecting requests.
    Open,
    /// Testing whether the channel recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probes_in_flight: u32,
    transitioned_at: Instant,
    transitioned_at_utc: DateTime<Utc>,
}

/// Circuit breaker for one channel.
pub struct CircuitBreaker {
    channel: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state.
    pub fn new(channel: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            channel: channel.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                probes_in_flight: 0,
                transitioned_at: Instant::now(),
                transitioned_at_utc: Utc::now(),
            }),
            metrics: None,
        }
    }

    fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.expire_open(&mut inner);
        inner.state
    }

    /// Check if the circuit admits a request. In the half-open state this
    /// reserves one of the probe slots.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.expire_open(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    info!(channel = %self.channel, "Circuit breaker closed after successful recovery");
                }
            }
            // Late result of a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        channel = %self.channel,
                        failures,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                warn!(channel = %self.channel, "Circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.consecutive_failures = 0;
        debug!(channel = %self.channel, "Circuit breaker reset to closed state");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.expire_open(&mut inner);
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_transition: inner.transitioned_at_utc,
        }
    }

    /// Open -> half-open once the open timeout has elapsed.
    fn expire_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner.transitioned_at.elapsed() >= self.config.open_timeout()
        {
            self.transition(inner, CircuitState::HalfOpen);
            debug!(channel = %self.channel, "Circuit breaker transitioned to half-open state");
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.probes_in_flight = 0;
        inner.transitioned_at = Instant::now();
        inner.transitioned_at_utc = Utc::now();
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_transition(&self.channel, to);
        }
    }
}

/// Arena of circuit breakers keyed by channel identifier.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(config: CircuitBreakerConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            metrics: Some(metrics),
        }
    }

    /// Get or create the breaker for a channel.
    pub fn get(&self, channel: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(channel) {
            return breaker.clone();
        }

        self.breakers
            .entry(channel.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(channel, self.config.clone());
                Arc::new(match &self.metrics {
                    Some(metrics) => breaker.with_metrics(metrics.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    /// Reset a channel's breaker to closed.
    pub fn reset(&self, channel: &str) -> crate::Result<()> {
        let breaker = self
            .breakers
            .get(channel)
            .map(|b| b.clone())
            .ok_or_else(|| crate::Error::not_found("CircuitBreaker", channel))?;
        breaker.reset();
        Ok(())
    }

    /// Snapshot of every breaker created so far.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("webhook", CircuitBreakerConfig::default())
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            assert!(breaker.allow_request());
            breaker.record_failure();
        }
    }

    #[test]
    fn test_circuit_breaker_closed() {
        let breaker = breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_five_consecutive_failures() {
        let metrics = Arc::new(MetricsCollector::new());
        let breaker = breaker().with_metrics(metrics.clone());

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());

        // Further failures while open do not transition again.
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(metrics.snapshot().circuit_transitions["webhook:open"], 1);
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let breaker = breaker();
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_until_open_timeout_elapses() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breaker.allow_request());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
        // Only one probe at a time.
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_two_successes() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_restarts_timeout() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.allow_request());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_circuit_breaker_reset() {
        let breaker = breaker();
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn registry_isolates_channels() {
        let registry = CircuitBreakerRegistry::default();
        trip(&registry.get("webhook"));

        assert!(!registry.get("webhook").allow_request());
        assert!(registry.get("console").allow_request());
        assert!(Arc::ptr_eq(&registry.get("webhook"), &registry.get("webhook")));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["webhook"].state, CircuitState::Open);
        assert_eq!(snapshot["console"].state, CircuitState::Closed);
    }

    #[test]
    fn registry_reset_unknown_channel_is_not_found() {
        let registry = CircuitBreakerRegistry::default();
        assert!(matches!(
            registry.reset("nope"),
            Err(crate::Error::NotFound { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
