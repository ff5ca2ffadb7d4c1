//! The normalized event envelope every source produces.
//!
//! Events are published as CloudEvents 1.0 JSON. JSON payloads are embedded
//! under `data`; anything else is carried base64-encoded under `data_base64`.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// CloudEvents specification version stamped on every envelope.
pub const SPEC_VERSION: &str = "1.0";

/// Attribute keys reserved for routing. They always reflect the event's own
/// fields and override same-named entries in [`NormalizedEvent::attributes`].
pub const ROUTING_KEYS: [&str; 3] = ["type", "source", "id"];

/// Why a native item or payload could not be turned into a [`NormalizedEvent`].
///
/// Conversion failures are scoped to one item: the caller skips it and moves
/// on.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// The common envelope for all collected events.
///
/// `id` + `source` is unique within one cursor epoch. `time` is not
/// guaranteed to be monotonic, even within a single page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub id: String,
    /// URI-like origin, e.g. `//github.com/org/repo`.
    pub source: String,
    /// Dot-namespaced classifier, e.g. `github.PushEvent`.
    pub event_type: String,
    pub time: DateTime<Utc>,
    /// Source-specific payload, usually JSON.
    pub payload: Vec<u8>,
    pub subject: Option<String>,
    /// Routing/filter metadata attached to the bus message.
    pub attributes: BTreeMap<String, String>,
}

impl NormalizedEvent {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        time: DateTime<Utc>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        NormalizedEvent {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            time,
            payload: payload.into(),
            subject: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        let subject = subject.into();
        self.subject = (!subject.is_empty()).then_some(subject);
        self
    }

    /// Adds an attribute. Empty values are skipped.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.attributes.insert(key.into(), value);
        }
        self
    }

    /// Size of the payload in bytes, as counted against batch byte limits.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Attributes for the bus message: the event's own attributes plus
    /// `type`, `source` and `id`.
    pub fn routing_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = self.attributes.clone();
        attributes.insert("type".to_string(), self.event_type.clone());
        attributes.insert("source".to_string(), self.source.clone());
        attributes.insert("id".to_string(), self.id.clone());
        attributes
    }

    /// Encodes the event as a CloudEvents JSON document.
    pub fn to_cloudevent_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let (data, data_base64) = match serde_json::from_slice::<serde_json::Value>(&self.payload) {
            Ok(value) => (Some(value), None),
            Err(_) if self.payload.is_empty() => (None, None),
            Err(_) => (None, Some(BASE64.encode(&self.payload))),
        };

        let envelope = CloudEventEnvelope {
            specversion: SPEC_VERSION,
            id: &self.id,
            source: &self.source,
            event_type: &self.event_type,
            time: self.time,
            subject: self.subject.as_deref(),
            datacontenttype: data.as_ref().map(|_| "application/json"),
            data,
            data_base64,
            extensions: &self.attributes,
        };
        serde_json::to_vec(&envelope)
    }
}

#[derive(Serialize)]
struct CloudEventEnvelope<'a> {
    specversion: &'static str,
    id: &'a str,
    source: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datacontenttype: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_base64: Option<String>,
    #[serde(skip_serializing_if = "is_empty_map")]
    extensions: &'a BTreeMap<String, String>,
}

fn is_empty_map(map: &&BTreeMap<String, String>) -> bool {
    map.is_empty()
}
