//! Kubernetes `Event` objects from the API server's watch endpoint.
//!
//! The watch is a long-lived `GET .../events?watch=true` whose body is one
//! JSON object per line: `{"type": "ADDED", "object": {...}}`. A fresh
//! watch first replays every existing event as `ADDED`, so events whose last
//! timestamp is older than [`DEFAULT_MAX_EVENT_AGE`] are filtered out.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::{debug, warn};

use super::watch::{WatchError, WatchFeed};
use crate::config::{ConfigError, Lookup, string_var};
use crate::types::{ConversionError, NormalizedEvent};

/// Events older than this are not forwarded.
pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(60 * 60);

/// Cluster name used in event sources when none is configured.
pub const DEFAULT_CLUSTER_NAME: &str = "unknown";

/// Connection settings for the events watch.
#[derive(Clone)]
pub struct KubeWatchConfig {
    /// API server base URL, e.g. `https://10.0.0.1:443`.
    pub api_url: String,
    pub token: Option<String>,
    /// PEM bundle to trust in addition to the system roots.
    pub ca_file: Option<PathBuf>,
    pub cluster: String,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub max_age: Duration,
}

impl std::fmt::Debug for KubeWatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchConfig")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_file", &self.ca_file)
            .field("cluster", &self.cluster)
            .field("namespace", &self.namespace)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl KubeWatchConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        KubeWatchConfig {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
            ca_file: None,
            cluster: DEFAULT_CLUSTER_NAME.to_string(),
            namespace: None,
            max_age: DEFAULT_MAX_EVENT_AGE,
        }
    }

    /// Reads `FWD_KUBE_*` variables. Returns `None` unless
    /// `FWD_KUBE_API_URL` is set.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Option<Self>, ConfigError> {
        let Some(api_url) = string_var(lookup, "FWD_KUBE_API_URL") else {
            return Ok(None);
        };
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                var: "FWD_KUBE_API_URL",
                value: api_url,
                reason: "expected an http(s) URL".to_string(),
            });
        }

        let mut config = KubeWatchConfig::new(api_url);
        config.token = string_var(lookup, "FWD_KUBE_TOKEN");
        config.ca_file = string_var(lookup, "FWD_KUBE_CA_FILE").map(PathBuf::from);
        config.namespace = string_var(lookup, "FWD_KUBE_NAMESPACE");
        if let Some(cluster) = string_var(lookup, "FWD_KUBE_CLUSTER") {
            config.cluster = cluster;
        }
        Ok(Some(config))
    }

    /// The watch URL, resuming after `resource_version` when given.
    pub fn watch_url(&self, resource_version: Option<&str>) -> String {
        let path = match &self.namespace {
            Some(ns) => format!("/api/v1/namespaces/{}/events", ns),
            None => "/api/v1/events".to_string(),
        };
        let mut url = format!("{}{}?watch=true", self.api_url, path);
        if let Some(version) = resource_version {
            url.push_str("&resourceVersion=");
            url.push_str(version);
        }
        url
    }
}

/// One line of a watch response.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: serde_json::Value,
}

/// The fields of a core/v1 `Event` that the conversion reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeEvent {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub involved_object: ObjectReference,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub source: Option<EventSource>,
    #[serde(default)]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectReference {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSource {
    #[serde(default)]
    pub component: Option<String>,
}

impl KubeEvent {
    /// `lastTimestamp`, falling back to `eventTime` for events written by
    /// the events.k8s.io API.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp.or(self.event_time)
    }

    /// Whether the event happened within `max_age` of `now`. Events without
    /// a timestamp are never recent.
    pub fn is_recent(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(timestamp) = self.timestamp() else {
            return false;
        };
        match TimeDelta::from_std(max_age) {
            Ok(window) => now.signed_duration_since(timestamp) < window,
            Err(_) => true,
        }
    }
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

/// Converts one event.
///
/// Type is `com.kubernetes.<kind>.<reason>` in lower case, source is
/// `kubernetes://<cluster>/<namespace>` (or `kubernetes://<cluster>` for
/// cluster-scoped objects), and the payload is the raw object.
pub fn convert_kube_event(
    event: &KubeEvent,
    raw: &serde_json::Value,
    cluster: &str,
) -> Result<NormalizedEvent, ConversionError> {
    let uid = field(&event.metadata.uid);
    if uid.is_empty() {
        return Err(ConversionError::MissingField("metadata.uid"));
    }
    let time = event
        .timestamp()
        .ok_or(ConversionError::MissingField("lastTimestamp"))?;

    let involved = &event.involved_object;
    let kind = field(&involved.kind);
    let name = field(&involved.name);
    let namespace = field(&involved.namespace);
    let reason = field(&event.reason);

    let source = if namespace.is_empty() {
        format!("kubernetes://{}", cluster)
    } else {
        format!("kubernetes://{}/{}", cluster, namespace)
    };

    Ok(NormalizedEvent::new(
        uid,
        source,
        format!(
            "com.kubernetes.{}.{}",
            kind.to_lowercase(),
            reason.to_lowercase()
        ),
        time,
        serde_json::to_vec(raw)?,
    )
    .with_subject(format!("{}/{}", kind, name))
    .with_attribute("namespace", namespace)
    .with_attribute("kind", kind)
    .with_attribute("name", name)
    .with_attribute("reason", reason)
    .with_attribute("severity", field(&event.event_type))
    .with_attribute(
        "component",
        event
            .source
            .as_ref()
            .map(|s| field(&s.component))
            .unwrap_or_default(),
    ))
}

/// Longest watch line accepted before the stream is abandoned.
pub const MAX_WATCH_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Splits a chunked body into newline-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes already searched for a newline.
    scanned: usize,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_WATCH_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_limit(limit: usize) -> Self {
        LineBuffer {
            buf: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete, non-blank line without its terminator.
    ///
    /// Fails once a line grows past the limit; the buffer is unusable after
    /// that and the watch should be reopened.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, WatchError> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.limit {
                    return Err(WatchError::LineTooLong { limit: self.limit });
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if end > self.limit {
                return Err(WatchError::LineTooLong { limit: self.limit });
            }
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let trimmed = line.trim_ascii();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_vec()));
            }
        }
    }
}

/// Decodes a watch response body into watch events.
fn watch_events(response: reqwest::Response) -> BoxStream<'static, Result<WatchEvent, WatchError>> {
    futures::stream::unfold(
        Some((response, LineBuffer::default())),
        |state| async move {
            let (mut response, mut lines) = state?;
            loop {
                match lines.next_line() {
                    Ok(Some(line)) => {
                        let decoded: Result<WatchEvent, WatchError> =
                            serde_json::from_slice(&line).map_err(WatchError::from);
                        return Some((decoded, Some((response, lines))));
                    }
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), None)),
                }
                match response.chunk().await {
                    Ok(Some(chunk)) => lines.push(&chunk),
                    Ok(None) => return None,
                    Err(e) => return Some((Err(WatchError::from(e)), None)),
                }
            }
        },
    )
    .boxed()
}

/// Watches core/v1 events through the API server.
pub struct KubeEventFeed {
    client: reqwest::Client,
    config: KubeWatchConfig,
    /// Last resource version seen, so a reopened watch resumes instead of
    /// replaying.
    resource_version: Mutex<Option<String>>,
}

impl KubeEventFeed {
    pub fn new(config: KubeWatchConfig) -> Result<Self, WatchError> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(path) = &config.ca_file {
            let pem = std::fs::read(path).map_err(|e| {
                WatchError::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(KubeEventFeed {
            client: builder.build()?,
            config,
            resource_version: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &KubeWatchConfig {
        &self.config
    }

    fn last_version(&self) -> Option<String> {
        self.resource_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_version(&self, version: Option<String>) {
        *self
            .resource_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version;
    }

    /// Converts one watch line, filtering deletions and stale events.
    fn convert_watch_event(
        &self,
        watch_event: WatchEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<NormalizedEvent>, ConversionError> {
        match watch_event.kind.as_str() {
            "ADDED" | "MODIFIED" => {}
            "ERROR" => {
                // Usually 410 Gone: the stored version is too old to resume.
                warn!(status = %watch_event.object, "Watch reported an error, resetting resource version");
                self.record_version(None);
                return Ok(None);
            }
            other => {
                debug!(kind = other, "Ignoring watch event");
                return Ok(None);
            }
        }

        let event: KubeEvent = serde_json::from_value(watch_event.object.clone())?;
        if let Some(version) = &event.metadata.resource_version {
            self.record_version(Some(version.clone()));
        }
        if !event.is_recent(now, self.config.max_age) {
            return Ok(None);
        }
        convert_kube_event(&event, &watch_event.object, &self.config.cluster).map(Some)
    }
}

impl WatchFeed for KubeEventFeed {
    type Item = WatchEvent;

    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn watch(&self) -> Result<BoxStream<'static, Result<WatchEvent, WatchError>>, WatchError> {
        let url = self.config.watch_url(self.last_version().as_deref());
        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 410 {
                self.record_version(None);
            }
            let message = response.text().await.unwrap_or_default();
            return Err(WatchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(watch_events(response))
    }

    fn convert(&self, item: WatchEvent) -> Result<Option<NormalizedEvent>, ConversionError> {
        self.convert_watch_event(item, Utc::now())
    }
}
