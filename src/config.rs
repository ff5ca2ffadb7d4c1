//! Process configuration read from environment variables.
//!
//! Every setting has a `DEFAULT_*` constant except the topic, which is
//! required. Parsing goes through a [`Lookup`] function so tests can supply
//! variables without touching the process environment.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::collector::CollectorConfig;
use crate::pipeline::bus::PubSubConfig;
use crate::pipeline::{BatchLimits, DEFAULT_QUEUE_CAPACITY, PublisherConfig, RetryConfig};
use crate::push::kubernetes::KubeWatchConfig;

/// Default HTTP listen address for webhooks and health checks.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default per-batch event count.
pub const DEFAULT_BATCH_MAX_EVENTS: usize = crate::pipeline::batch::DEFAULT_MAX_EVENTS;

/// Default per-batch payload byte threshold.
pub const DEFAULT_BATCH_MAX_BYTES: usize = crate::pipeline::batch::DEFAULT_MAX_BYTES;

/// Default linger time in milliseconds.
pub const DEFAULT_BATCH_LINGER_MS: u64 = 100;

/// Default number of retries for a failed batch.
pub const DEFAULT_PUBLISH_RETRIES: u32 = 2;

/// Upper bound for `FWD_PUBLISH_RETRIES`.
pub const MAX_PUBLISH_RETRIES: u32 = 10;

/// Reads one variable by name.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where published messages go.
#[derive(Debug, Clone)]
pub enum BusTarget {
    /// Log messages instead of publishing them.
    DryRun,
    PubSub(PubSubConfig),
}

/// All process settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusTarget,
    pub listen_addr: SocketAddr,
    pub queue_capacity: usize,
    pub publisher: PublisherConfig,

    /// HMAC secret for GitHub webhooks. Empty disables validation.
    pub github_webhook_secret: String,

    /// HMAC secret for Terraform Cloud notifications. Empty disables
    /// validation.
    pub tfc_webhook_secret: String,

    pub github_token: Option<String>,

    /// `None` when no organisations are configured.
    pub collector: Option<CollectorConfig>,

    /// `None` when no Kubernetes API server is configured.
    pub kubernetes: Option<KubeWatchConfig>,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let topic = string_var(lookup, "FWD_TOPIC").ok_or(ConfigError::Missing("FWD_TOPIC"))?;

        let dry_run = flag_var(lookup, "FWD_DRY_RUN")?;
        let bus = if dry_run {
            BusTarget::DryRun
        } else {
            let project = string_var(lookup, "FWD_PUBSUB_PROJECT")
                .ok_or(ConfigError::Missing("FWD_PUBSUB_PROJECT"))?;
            match string_var(lookup, "PUBSUB_EMULATOR_HOST") {
                Some(host) => BusTarget::PubSub(PubSubConfig::emulator(project, &host)),
                None => BusTarget::PubSub(PubSubConfig::new(
                    project,
                    string_var(lookup, "FWD_PUBSUB_TOKEN"),
                )),
            }
        };

        let linger_ms: u64 = parse_var(lookup, "FWD_BATCH_LINGER_MS", DEFAULT_BATCH_LINGER_MS)?;
        let retries: u32 = parse_var(lookup, "FWD_PUBLISH_RETRIES", DEFAULT_PUBLISH_RETRIES)?;
        if retries > MAX_PUBLISH_RETRIES {
            return Err(ConfigError::Invalid {
                var: "FWD_PUBLISH_RETRIES",
                value: retries.to_string(),
                reason: format!("must be at most {}", MAX_PUBLISH_RETRIES),
            });
        }
        let publisher = PublisherConfig {
            topic,
            limits: BatchLimits {
                max_events: parse_var(lookup, "FWD_BATCH_MAX_EVENTS", DEFAULT_BATCH_MAX_EVENTS)?
                    .max(1),
                max_bytes: parse_var(lookup, "FWD_BATCH_MAX_BYTES", DEFAULT_BATCH_MAX_BYTES)?
                    .max(1),
                max_linger: Duration::from_millis(linger_ms),
            },
            retry: RetryConfig::DEFAULT.with_max_retries(retries),
        };

        Ok(Config {
            bus,
            listen_addr: parse_var(
                lookup,
                "FWD_LISTEN_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            queue_capacity: parse_var(lookup, "FWD_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            publisher,
            github_webhook_secret: string_var(lookup, "FWD_GITHUB_WEBHOOK_SECRET")
                .unwrap_or_default(),
            tfc_webhook_secret: string_var(lookup, "FWD_TFC_WEBHOOK_SECRET").unwrap_or_default(),
            github_token: string_var(lookup, "GITHUB_TOKEN"),
            collector: CollectorConfig::from_lookup(lookup)?,
            kubernetes: KubeWatchConfig::from_lookup(lookup)?,
        })
    }

    pub fn topic(&self) -> &str {
        &self.publisher.topic
    }
}

/// Returns the trimmed value of `var`, treating empty as unset.
pub(crate) fn string_var(lookup: Lookup<'_>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses `var`, falling back to `default` when it is unset.
pub(crate) fn parse_var<T>(lookup: Lookup<'_>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match string_var(lookup, var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

/// Splits a comma-separated list, dropping empty entries.
pub(crate) fn list_var(lookup: Lookup<'_>, var: &str) -> Vec<String> {
    string_var(lookup, var)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn flag_var(lookup: Lookup<'_>, var: &'static str) -> Result<bool, ConfigError> {
    match string_var(lookup, var) {
        None => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&|key| vars.get(key).cloned())
    }

    #[test]
    fn topic_is_required() {
        let err = load(&[("FWD_DRY_RUN", "true")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FWD_TOPIC")));
    }

    #[test]
    fn project_is_required_unless_dry_run() {
        let err = load(&[("FWD_TOPIC", "events")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FWD_PUBSUB_PROJECT")));

        let config = load(&[("FWD_TOPIC", "events"), ("FWD_DRY_RUN", "1")]).unwrap();
        assert!(matches!(config.bus, BusTarget::DryRun));
    }

    #[test]
    fn defaults_match_constants() {
        let config = load(&[("FWD_TOPIC", "events"), ("FWD_DRY_RUN", "yes")]).unwrap();

        assert_eq!(config.topic(), "events");
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.publisher.limits, BatchLimits::default());
        assert_eq!(config.publisher.retry.max_retries, DEFAULT_PUBLISH_RETRIES);
        assert!(config.github_webhook_secret.is_empty());
        assert!(config.collector.is_none());
        assert!(config.kubernetes.is_none());
    }

    #[test]
    fn emulator_host_selects_plain_http() {
        let config = load(&[
            ("FWD_TOPIC", "events"),
            ("FWD_PUBSUB_PROJECT", "local"),
            ("PUBSUB_EMULATOR_HOST", "localhost:8085"),
            ("FWD_PUBSUB_TOKEN", "ignored"),
        ])
        .unwrap();

        match config.bus {
            BusTarget::PubSub(pubsub) => {
                assert_eq!(pubsub.endpoint, "http://localhost:8085");
                assert!(pubsub.token.is_none());
            }
            BusTarget::DryRun => panic!("expected Pub/Sub target"),
        }
    }

    #[test]
    fn batch_settings_are_parsed() {
        let config = load(&[
            ("FWD_TOPIC", "events"),
            ("FWD_DRY_RUN", "true"),
            ("FWD_BATCH_MAX_EVENTS", "10"),
            ("FWD_BATCH_MAX_BYTES", "2048"),
            ("FWD_BATCH_LINGER_MS", "250"),
            ("FWD_PUBLISH_RETRIES", "0"),
            ("FWD_QUEUE_CAPACITY", "50"),
        ])
        .unwrap();

        assert_eq!(config.publisher.limits.max_events, 10);
        assert_eq!(config.publisher.limits.max_bytes, 2048);
        assert_eq!(config.publisher.limits.max_linger, Duration::from_millis(250));
        assert_eq!(config.publisher.retry.max_retries, 0);
        assert_eq!(config.queue_capacity, 50);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[
            ("FWD_TOPIC", "events"),
            ("FWD_DRY_RUN", "true"),
            ("FWD_LISTEN_ADDR", "not-an-address"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FWD_LISTEN_ADDR", .. }));

        let err = load(&[("FWD_TOPIC", "events"), ("FWD_DRY_RUN", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FWD_DRY_RUN", .. }));
    }

    #[test]
    fn publish_retries_are_bounded() {
        let err = load(&[
            ("FWD_TOPIC", "events"),
            ("FWD_DRY_RUN", "true"),
            ("FWD_PUBLISH_RETRIES", "4294967295"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FWD_PUBLISH_RETRIES", .. }));

        let config = load(&[
            ("FWD_TOPIC", "events"),
            ("FWD_DRY_RUN", "true"),
            ("FWD_PUBLISH_RETRIES", "10"),
        ])
        .unwrap();
        assert_eq!(config.publisher.retry.max_retries, MAX_PUBLISH_RETRIES);
    }
}
