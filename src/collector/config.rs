//! Polling configuration for the incremental collector.
//!
//! # Defaults
//!
//! - **Poll interval**: 30 seconds, with one cycle immediately on start
//! - **Cutoff window**: 24 hours; older items are never emitted on a first run
//! - **Rate limit**: 300 requests per second with a burst of 3, shared by the
//!   whole cycle
//! - **Enqueue wait**: 5 seconds before the key's cycle is abandoned
//! - **Emit order**: oldest first within one key

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::{ConfigError, Lookup, list_var, parse_var};
use crate::types::RepoId;

/// Default interval between collection cycles (30 seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default lookback window for items with no cursor (24 hours).
pub const DEFAULT_CUTOFF_HOURS: u64 = 24;

/// Default sustained request rate.
pub const DEFAULT_RATE_LIMIT_PER_SEC: u32 = 300;

/// Default request burst.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 3;

/// Default maximum wait for queue capacity (5 seconds).
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5000;

/// Default number of keys collected concurrently.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Order in which one key's new items are enqueued.
///
/// Listings are scanned newest first. Downstream consumers usually expect
/// chronological order, so the default reverses the scan before enqueueing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmitOrder {
    #[default]
    OldestFirst,

    /// Newest first, exactly as scanned.
    ScanOrder,
}

impl std::str::FromStr for EmitOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest-first" | "oldest" | "chronological" => Ok(EmitOrder::OldestFirst),
            "scan" | "newest-first" | "newest" => Ok(EmitOrder::ScanOrder),
            other => Err(format!("unknown emit order {other:?}")),
        }
    }
}

/// Configuration for [`super::IncrementalCollector`].
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Top-level groupings (GitHub organisations) whose keys are polled.
    pub groups: Vec<String>,

    /// When set, only these keys are polled. Entries are `owner/repo` or a
    /// bare repository name.
    pub allow: Option<BTreeSet<String>>,

    pub poll_interval: Duration,

    /// Items older than `now - cutoff` are out of window.
    pub cutoff: Duration,

    /// Requests per second; zero disables rate limiting.
    pub rate_per_sec: u32,

    pub burst: u32,

    /// How long an enqueue may wait for queue capacity.
    pub enqueue_timeout: Duration,

    /// Maximum number of keys collected at the same time.
    pub concurrency: usize,

    pub emit_order: EmitOrder,
}

impl CollectorConfig {
    pub fn new(groups: Vec<String>) -> Self {
        CollectorConfig {
            groups,
            allow: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            cutoff: Duration::from_secs(DEFAULT_CUTOFF_HOURS * 3600),
            rate_per_sec: DEFAULT_RATE_LIMIT_PER_SEC,
            burst: DEFAULT_RATE_LIMIT_BURST,
            enqueue_timeout: Duration::from_millis(DEFAULT_ENQUEUE_TIMEOUT_MS),
            concurrency: DEFAULT_CONCURRENCY,
            emit_order: EmitOrder::default(),
        }
    }

    /// Reads the collector settings.
    ///
    /// Returns `Ok(None)` when `FWD_GITHUB_ORGS` is unset or empty, which
    /// disables the collector.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Option<Self>, ConfigError> {
        let groups = list_var(lookup, "FWD_GITHUB_ORGS");
        if groups.is_empty() {
            return Ok(None);
        }

        let allow: BTreeSet<String> = list_var(lookup, "FWD_GITHUB_REPOS").into_iter().collect();
        let poll_secs: u64 = parse_var(lookup, "FWD_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        let cutoff_hours: u64 = parse_var(lookup, "FWD_CUTOFF_HOURS", DEFAULT_CUTOFF_HOURS)?;
        let enqueue_ms: u64 = parse_var(
            lookup,
            "FWD_COLLECTOR_ENQUEUE_TIMEOUT_MS",
            DEFAULT_ENQUEUE_TIMEOUT_MS,
        )?;

        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "FWD_POLL_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let cutoff_secs = cutoff_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::Invalid {
                var: "FWD_CUTOFF_HOURS",
                value: cutoff_hours.to_string(),
                reason: "too large".to_string(),
            })?;

        Ok(Some(CollectorConfig {
            allow: (!allow.is_empty()).then_some(allow),
            poll_interval: Duration::from_secs(poll_secs),
            cutoff: Duration::from_secs(cutoff_secs),
            rate_per_sec: parse_var(lookup, "FWD_RATE_LIMIT_PER_SEC", DEFAULT_RATE_LIMIT_PER_SEC)?,
            burst: parse_var(lookup, "FWD_RATE_LIMIT_BURST", DEFAULT_RATE_LIMIT_BURST)?,
            enqueue_timeout: Duration::from_millis(enqueue_ms),
            concurrency: parse_var(lookup, "FWD_COLLECTOR_CONCURRENCY", DEFAULT_CONCURRENCY)?
                .max(1),
            emit_order: parse_var(lookup, "FWD_EMIT_ORDER", EmitOrder::default())?,
            ..Self::new(groups)
        }))
    }

    /// Returns whether `key` passes the allow-list.
    pub fn is_allowed(&self, key: &RepoId) -> bool {
        match &self.allow {
            None => true,
            Some(allow) => allow.contains(&key.full_name()) || allow.contains(&key.repo),
        }
    }
}
