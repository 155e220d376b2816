//! Retry policy for channel deliveries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::channels::DeliveryError;
use super::classify::classify;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of delivery attempts per channel, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplicative jitter, as a fraction of the delay (0.1 = ±10%).
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 30_000,
            max_delay_ms: 480_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::Error::config("retry.max_attempts must be at least 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(crate::Error::config(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(crate::Error::config("retry.jitter_ratio must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Decides whether a failed attempt is retried and how long to wait.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt should follow attempt `attempt` (1-based),
    /// which failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &DeliveryError) -> bool {
        attempt < self.config.max_attempts && classify(error).is_retryable()
    }

    /// Backoff before retry number `retry` (0-based):
    /// `min(max_delay, base_delay * 2^retry)` with multiplicative jitter.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let capped = self.capped_delay_ms(retry) as f64;
        let ratio = self.config.jitter_ratio;
        let factor = if ratio > 0.0 {
            // Uniform in [1 - ratio, 1 + ratio].
            1.0 - ratio + 2.0 * ratio * rand::random::<f64>()
        } else {
            1.0
        };
        Duration::from_millis((capped * factor).round() as u64)
    }

    fn capped_delay_ms(&self, retry: u32) -> u64 {
        let multiplier = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        self.config
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.config.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter_ratio: 0.0,
            ..Default::default()
        })
    }

    fn http(status: u16) -> DeliveryError {
        DeliveryError::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 30_000);
        assert_eq!(config.max_delay_ms, 480_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_calculation() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(0), Duration::from_secs(30));
        assert_eq!(policy.next_delay(1), Duration::from_secs(60));
        assert_eq!(policy.next_delay(2), Duration::from_secs(120));
        assert_eq!(policy.next_delay(3), Duration::from_secs(240));
        assert_eq!(policy.next_delay(4), Duration::from_secs(480));
        assert_eq!(policy.next_delay(40), Duration::from_secs(480)); // Capped at max
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(480));
    }

    #[test]
    fn permanent_errors_never_retry() {
        let policy = RetryPolicy::default();
        for status in [400, 401, 403, 404, 422] {
            assert!(!policy.should_retry(1, &http(status)));
        }
    }

    #[test]
    fn transient_and_unknown_errors_retry_until_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &http(503)));
        assert!(policy.should_retry(4, &DeliveryError::Other("weird".into())));
        assert!(!policy.should_retry(5, &http(503)));
        assert!(!policy.should_retry(5, &DeliveryError::Other("weird".into())));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let zero = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let inverted = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn delay_never_exceeds_jittered_cap(retry in 0u32..64) {
            let policy = RetryPolicy::default();
            let cap = policy.config().max_delay_ms as f64 * 1.1;
            prop_assert!(policy.next_delay(retry).as_millis() as f64 <= cap.ceil());
        }

        #[test]
        fn delay_is_monotonic_below_cap(retry in 0u32..4) {
            // 30s * 2^4 = 480s, so retries 0..4 grow strictly below the cap.
            let policy = RetryPolicy::default();
            prop_assert!(policy.next_delay(retry) <= policy.next_delay(retry + 1));
        }

        #[test]
        fn permanent_status_stops_on_first_attempt(
            status in prop::sample::select(vec![400u16, 401, 403, 404, 422])
        ) {
            let policy = RetryPolicy::default();
            prop_assert!(!policy.should_retry(1, &http(status)));
        }
    }
}
