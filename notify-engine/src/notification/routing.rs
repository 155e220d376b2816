//! Label and severity based routing.
//!
//! Resolution order for a request:
//! 1. channels named explicitly by the caller;
//! 2. the first routing rule whose matchers all hold;
//! 3. the severity default for the request's severity;
//! 4. the single default channel.
//!
//! Once the registered channels are known, rule and severity routes only
//! keep channels that have a deliverer. A route left empty falls through to
//! the next stage, so a routed notification always reaches a real channel.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::request::{ChannelTarget, NotificationPriority, NotificationRequest};
use crate::{Error, Result};

/// Label that overrides the request priority when choosing severity defaults.
pub const SEVERITY_LABEL: &str = "severity";

/// A predicate over one request label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LabelMatcherConfig {
    Equals { label: String, value: String },
    NotEquals { label: String, value: String },
    Regex { label: String, pattern: String },
    Exists { label: String },
}

/// A routing rule as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// All matchers must hold. An empty list matches every request.
    #[serde(default)]
    pub matchers: Vec<LabelMatcherConfig>,
    pub channels: Vec<String>,
    /// Priority the matched notification is delivered with.
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
    #[serde(default)]
    pub group_wait_secs: u64,
}

/// Channels and grouping delay for one severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityRoute {
    pub channels: Vec<String>,
    #[serde(default)]
    pub group_wait_secs: u64,
}

impl SeverityRoute {
    fn new(channel: &str, group_wait_secs: u64) -> Self {
        Self {
            channels: vec![channel.to_string()],
            group_wait_secs,
        }
    }
}

/// Routing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Rules in priority order. The first match wins.
    pub rules: Vec<RoutingRule>,
    pub severity_defaults: BTreeMap<NotificationPriority, SeverityRoute>,
    /// Fallback when nothing else applies.
    pub default_channel: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let severity_defaults = BTreeMap::from([
            (NotificationPriority::Critical, SeverityRoute::new("pager", 0)),
            (NotificationPriority::High, SeverityRoute::new("team-chat", 30)),
            (NotificationPriority::Low, SeverityRoute::new("console", 300)),
        ]);
        Self {
            rules: Vec::new(),
            severity_defaults,
            default_channel: "console".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum LabelMatcher {
    Equals { label: String, value: String },
    NotEquals { label: String, value: String },
    Regex { label: String, regex: Regex },
    Exists { label: String },
}

impl LabelMatcher {
    fn compile(config: &LabelMatcherConfig) -> Result<Self> {
        Ok(match config {
            LabelMatcherConfig::Equals { label, value } => Self::Equals {
                label: label.clone(),
                value: value.clone(),
            },
            LabelMatcherConfig::NotEquals { label, value } => Self::NotEquals {
                label: label.clone(),
                value: value.clone(),
            },
            LabelMatcherConfig::Regex { label, pattern } => {
                // Anchored, like label matchers in alert routers.
                let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                    Error::config(format!("invalid routing regex {pattern:?}: {e}"))
                })?;
                Self::Regex {
                    label: label.clone(),
                    regex,
                }
            }
            LabelMatcherConfig::Exists { label } => Self::Exists {
                label: label.clone(),
            },
        })
    }

    fn matches(&self, request: &NotificationRequest) -> bool {
        match self {
            Self::Equals { label, value } => request.label(label) == Some(value.as_str()),
            // A missing label is not equal to anything.
            Self::NotEquals { label, value } => request.label(label) != Some(value.as_str()),
            Self::Regex { label, regex } => request.label(label).is_some_and(|v| regex.is_match(v)),
            Self::Exists { label } => request.label(label).is_some(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RoutingRule,
    matchers: Vec<LabelMatcher>,
}

impl CompiledRule {
    fn matches(&self, request: &NotificationRequest) -> bool {
        self.matchers.iter().all(|m| m.matches(request))
    }
}

/// Where a routing decision came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RouteSource {
    Explicit,
    Rule(String),
    Severity(NotificationPriority),
    Default,
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("explicit"),
            Self::Rule(name) => write!(f, "rule:{name}"),
            Self::Severity(priority) => write!(f, "severity:{priority}"),
            Self::Default => f.write_str("default"),
        }
    }
}

/// Concrete channel set and priority for one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub channels: Vec<String>,
    pub priority: NotificationPriority,
    /// Grouping delay advertised by the matched route. Informational.
    pub group_wait: Duration,
    pub source: RouteSource,
}

/// Maps requests to channels.
#[derive(Debug, Clone)]
pub struct RoutingResolver {
    rules: Vec<CompiledRule>,
    severity_defaults: BTreeMap<NotificationPriority, SeverityRoute>,
    default_channel: String,
    /// Channels with a registered deliverer. `None` accepts every channel.
    known_channels: Option<BTreeSet<String>>,
}

impl RoutingResolver {
    /// Compile a routing configuration. Invalid regexes, rules without
    /// channels and an empty default channel are configuration errors.
    pub fn new(config: RoutingConfig) -> Result<Self> {
        if config.default_channel.trim().is_empty() {
            return Err(Error::config("routing.default_channel must not be empty"));
        }

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in config.rules {
            if rule.channels.is_empty() {
                return Err(Error::config(format!(
                    "routing rule {:?} has no channels",
                    rule.name
                )));
            }
            let matchers = rule
                .matchers
                .iter()
                .map(LabelMatcher::compile)
                .collect::<Result<Vec<_>>>()?;
            rules.push(CompiledRule { rule, matchers });
        }

        let severity_defaults = config
            .severity_defaults
            .into_iter()
            .filter(|(_, route)| !route.channels.is_empty())
            .collect();

        Ok(Self {
            rules,
            severity_defaults,
            default_channel: config.default_channel,
            known_channels: None,
        })
    }

    /// Restrict rule and severity routes to channels that have a registered
    /// deliverer. The default channel must be one of them.
    pub fn with_known_channels<I, S>(mut self, channels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known: BTreeSet<String> = channels.into_iter().map(Into::into).collect();
        if !known.contains(&self.default_channel) {
            return Err(Error::config(format!(
                "routing.default_channel {:?} has no registered channel",
                self.default_channel
            )));
        }

        let routes = self
            .rules
            .iter()
            .map(|r| (format!("rule:{}", r.rule.name), &r.rule.channels))
            .chain(
                self.severity_defaults
                    .iter()
                    .map(|(p, r)| (format!("severity:{p}"), &r.channels)),
            );
        for (route, channels) in routes {
            let missing: Vec<&String> = channels.iter().filter(|c| !known.contains(*c)).collect();
            if !missing.is_empty() {
                warn!(route = %route, missing = ?missing, "Route names unregistered channels");
            }
        }

        self.known_channels = Some(known);
        Ok(self)
    }

    /// Channels of a route that can actually be delivered to.
    fn usable(&self, channels: &[String]) -> Vec<String> {
        match &self.known_channels {
            Some(known) => channels.iter().filter(|c| known.contains(*c)).cloned().collect(),
            None => channels.to_vec(),
        }
    }

    /// Resolve the channel set for a request. Always yields at least one
    /// channel.
    pub fn resolve(&self, request: &NotificationRequest) -> RouteDecision {
        let decision = self.resolve_inner(request);
        debug!(
            notification_id = request.id(),
            source = %decision.source,
            channels = ?decision.channels,
            "Resolved notification route"
        );
        decision
    }

    fn resolve_inner(&self, request: &NotificationRequest) -> RouteDecision {
        if let ChannelTarget::Explicit(channels) = request.target() {
            if !channels.is_empty() {
                return RouteDecision {
                    channels: channels.clone(),
                    priority: request.priority(),
                    group_wait: Duration::ZERO,
                    source: RouteSource::Explicit,
                };
            }
        }

        for compiled in self.rules.iter().filter(|r| r.matches(request)) {
            let rule = &compiled.rule;
            let channels = self.usable(&rule.channels);
            if channels.is_empty() {
                debug!(rule = %rule.name, "Matched rule has no registered channels, skipping");
                continue;
            }
            return RouteDecision {
                channels,
                priority: rule.priority.unwrap_or(request.priority()),
                group_wait: Duration::from_secs(rule.group_wait_secs),
                source: RouteSource::Rule(rule.name.clone()),
            };
        }

        let severity = severity_of(request);
        if let Some(route) = self.severity_defaults.get(&severity) {
            let channels = self.usable(&route.channels);
            if !channels.is_empty() {
                return RouteDecision {
                    channels,
                    priority: request.priority(),
                    group_wait: Duration::from_secs(route.group_wait_secs),
                    source: RouteSource::Severity(severity),
                };
            }
        }

        RouteDecision {
            channels: vec![self.default_channel.clone()],
            priority: request.priority(),
            group_wait: Duration::ZERO,
            source: RouteSource::Default,
        }
    }
}

/// The `severity` label wins over the request priority when it parses.
fn severity_of(request: &NotificationRequest) -> NotificationPriority {
    request
        .label(SEVERITY_LABEL)
        .and_then(|s| s.parse().ok())
        .unwrap_or(request.priority())
}
