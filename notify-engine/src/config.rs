//! Engine configuration.
//!
//! Configuration is read from an optional JSON file, then overridden by
//! `NOTIFY_*` environment variables, then validated. Invalid configuration
//! fails fast at startup.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditConfig, HttpAuditStoreConfig};
use crate::logging::LoggingOptions;
use crate::notification::{
    ChannelConfig, CircuitBreakerConfig, ConsoleConfig, DeliveryConfig, RetryConfig,
    RoutingConfig, RoutingResolver,
};
use crate::{Error, Result};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "NOTIFY_";

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub delivery: DeliveryConfig,
    pub audit: AuditConfig,
    pub routing: RoutingConfig,
    pub channels: Vec<ChannelConfig>,
    pub logging: LoggingOptions,
}

impl EngineConfig {
    /// Load configuration: file (if any), then environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply `NOTIFY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Keys are the full
    /// variable names, e.g. `NOTIFY_MAX_ATTEMPTS`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        // Retry
        override_parsed(&get, "MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        override_parsed(&get, "BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        override_parsed(&get, "MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        override_parsed(&get, "JITTER_RATIO", &mut self.retry.jitter_ratio)?;

        // Circuit breaker
        let breaker = &mut self.circuit_breaker;
        override_parsed(&get, "BREAKER_FAILURE_THRESHOLD", &mut breaker.failure_threshold)?;
        override_parsed(&get, "BREAKER_SUCCESS_THRESHOLD", &mut breaker.success_threshold)?;
        override_parsed(&get, "BREAKER_OPEN_TIMEOUT_SECS", &mut breaker.open_timeout_secs)?;

        // Delivery
        override_parsed(&get, "CHANNEL_TIMEOUT_SECS", &mut self.delivery.channel_timeout_secs)?;
        override_parsed(
            &get,
            "ORCHESTRATION_TIMEOUT_SECS",
            &mut self.delivery.orchestration_timeout_secs,
        )?;

        // Audit
        override_parsed(&get, "AUDIT_BUFFER_SIZE", &mut self.audit.buffer_size)?;
        override_parsed(&get, "AUDIT_BATCH_SIZE", &mut self.audit.batch_size)?;
        override_parsed(&get, "AUDIT_FLUSH_INTERVAL_MS", &mut self.audit.flush_interval_ms)?;
        override_parsed(&get, "AUDIT_MAX_RETRIES", &mut self.audit.max_retries)?;
        if let Some(url) = get("AUDIT_ENDPOINT") {
            match &mut self.audit.endpoint {
                Some(endpoint) => endpoint.url = url,
                None => {
                    self.audit.endpoint = Some(HttpAuditStoreConfig {
                        url,
                        bearer_token: None,
                        timeout_secs: 10,
                    })
                }
            }
        }
        if let Some(token) = get("AUDIT_TOKEN")
            && let Some(endpoint) = &mut self.audit.endpoint
        {
            endpoint.bearer_token = Some(token);
        }
        if let Some(path) = get("AUDIT_DEAD_LETTER_PATH") {
            self.audit.dead_letter_path = Some(path);
        }

        // Routing
        if let Some(channel) = get("DEFAULT_CHANNEL") {
            self.routing.default_channel = channel;
        }

        // Logging
        if let Some(filter) = get("LOG_FILTER") {
            self.logging.filter = filter;
        }
        override_parsed(&get, "LOG_FORMAT", &mut self.logging.format)?;
        if let Some(dir) = get("LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }

    /// Add a console channel when none is configured. Returns true if one
    /// was added, so the caller can report it once logging is up.
    pub fn ensure_channel(&mut self) -> bool {
        if !self.channels.is_empty() {
            return false;
        }
        self.channels.push(ChannelConfig::Console(ConsoleConfig::default()));
        true
    }

    /// Check every section. Routing rules are compiled to catch bad regexes.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.delivery.validate()?;
        self.audit.validate()?;
        RoutingResolver::new(self.routing.clone())?;

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id()) {
                return Err(Error::config(format!(
                    "duplicate channel id: {}",
                    channel.id()
                )));
            }
        }
        Ok(())
    }
}

fn override_parsed<G, T>(get: &G, name: &str, target: &mut T) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = get(name) {
        *target = raw.trim().parse().map_err(|e| {
            Error::config(format!("invalid value for {ENV_PREFIX}{name}: {raw:?} ({e})"))
        })?;
    }
    Ok(())
}
