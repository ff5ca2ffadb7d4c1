//! Google Cloud Pub/Sub over the REST API.
//!
//! A batch goes out as one or more `topics.publish` requests, split in order
//! so each stays within the service's per-request message and size limits.
//! Authentication is a bearer token supplied by the caller; against the
//! emulator no token is sent and the endpoint is plain HTTP.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{BusError, BusMessage, MessageBus};
use crate::types::MessageId;

/// Production Pub/Sub REST endpoint.
pub const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Most messages Pub/Sub accepts in one publish request.
pub const MAX_REQUEST_MESSAGES: usize = 1000;

/// Encoded request size budget, below the service's 10 MB limit.
pub const MAX_REQUEST_BYTES: usize = 9_500_000;

/// JSON framing per message (`{"data":"","attributes":{}}` and separators).
const MESSAGE_OVERHEAD_BYTES: usize = 64;

/// Framing per attribute (quotes, colon, comma).
const ATTRIBUTE_OVERHEAD_BYTES: usize = 6;

/// Connection settings for [`PubSubBus`].
#[derive(Clone)]
pub struct PubSubConfig {
    pub project: String,
    /// Base URL without trailing slash.
    pub endpoint: String,
    /// OAuth bearer token. `None` for the emulator.
    pub token: Option<String>,
}

impl PubSubConfig {
    pub fn new(project: impl Into<String>, token: Option<String>) -> Self {
        PubSubConfig {
            project: project.into(),
            endpoint: PUBSUB_ENDPOINT.to_string(),
            token,
        }
    }

    /// Targets a local emulator at `host` (e.g. `localhost:8085`).
    pub fn emulator(project: impl Into<String>, host: &str) -> Self {
        PubSubConfig {
            project: project.into(),
            endpoint: format!("http://{}", host.trim_end_matches('/')),
            token: None,
        }
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/v1/projects/{}/topics/{}", self.endpoint, self.project, topic)
    }
}

impl fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("project", &self.project)
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<PubsubMessage<'a>>,
}

#[derive(Serialize)]
struct PubsubMessage<'a> {
    data: String,
    #[serde(skip_serializing_if = "no_attributes")]
    attributes: &'a BTreeMap<String, String>,
}

fn no_attributes(attributes: &&BTreeMap<String, String>) -> bool {
    attributes.is_empty()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// A [`MessageBus`] backed by Cloud Pub/Sub.
#[derive(Debug, Clone)]
pub struct PubSubBus {
    client: reqwest::Client,
    config: PubSubConfig,
}

impl PubSubBus {
    pub fn new(config: PubSubConfig) -> Result<Self, BusError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BusError::permanent("failed to build HTTP client").with_source(e))?;
        Ok(PubSubBus { client, config })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Creates the topic if it does not exist.
    #[instrument(skip(self))]
    pub async fn ensure_topic(&self, topic: &str) -> Result<(), BusError> {
        let url = self.config.topic_url(topic);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => {
                debug!(topic, "Topic exists");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                let response = self
                    .authorize(self.client.put(&url).json(&serde_json::json!({})))
                    .send()
                    .await
                    .map_err(transport_error)?;
                let status = response.status();
                // 409: created concurrently by someone else.
                if status.is_success() || status == StatusCode::CONFLICT {
                    info!(topic, "Created topic");
                    Ok(())
                } else {
                    Err(status_error(response).await)
                }
            }
            _ => Err(status_error(response).await),
        }
    }
}

impl MessageBus for PubSubBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<MessageId, BusError> {
        let mut ids = self.publish_batch(topic, std::slice::from_ref(message)).await?;
        ids.pop()
            .ok_or_else(|| BusError::permanent("publish response contained no message id"))
    }

    async fn publish_batch(
        &self,
        topic: &str,
        messages: &[BusMessage],
    ) -> Result<Vec<MessageId>, BusError> {
        let mut ids = Vec::with_capacity(messages.len());
        for chunk in request_chunks(messages) {
            ids.extend(self.publish_request(topic, chunk).await?);
        }
        if !messages.is_empty() {
            debug!(topic, count = messages.len(), "Published batch");
        }
        Ok(ids)
    }
}

impl PubSubBus {
    async fn publish_request(
        &self,
        topic: &str,
        messages: &[BusMessage],
    ) -> Result<Vec<MessageId>, BusError> {
        let body = PublishRequest {
            messages: messages
                .iter()
                .map(|m| PubsubMessage {
                    data: BASE64.encode(&m.data),
                    attributes: &m.attributes,
                })
                .collect(),
        };

        let url = format!("{}:publish", self.config.topic_url(topic));
        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| BusError::transient("failed to decode publish response").with_source(e))?;

        if parsed.message_ids.len() != messages.len() {
            return Err(BusError::permanent(format!(
                "publish returned {} ids for {} messages",
                parsed.message_ids.len(),
                messages.len()
            )));
        }

        Ok(parsed.message_ids.into_iter().map(MessageId::new).collect())
    }
}

/// Upper bound on the bytes `message` adds to a publish request body.
fn encoded_size(message: &BusMessage) -> usize {
    let data = message.data.len().div_ceil(3).saturating_mul(4);
    let attributes: usize = message
        .attributes
        .iter()
        .map(|(k, v)| k.len() + v.len() + ATTRIBUTE_OVERHEAD_BYTES)
        .sum();
    data.saturating_add(attributes).saturating_add(MESSAGE_OVERHEAD_BYTES)
}

/// Splits `messages` into consecutive runs that each fit one publish request.
///
/// A single message larger than the byte budget still gets its own request;
/// the service rejects it and the error surfaces to the caller.
fn request_chunks(messages: &[BusMessage]) -> Vec<&[BusMessage]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0usize;

    for (i, message) in messages.iter().enumerate() {
        let size = encoded_size(message);
        let count = i - start;
        let full = count == MAX_REQUEST_MESSAGES || bytes.saturating_add(size) > MAX_REQUEST_BYTES;
        if count > 0 && full {
            chunks.push(&messages[start..i]);
            start = i;
            bytes = 0;
        }
        bytes = bytes.saturating_add(size);
    }
    if start < messages.len() {
        chunks.push(&messages[start..]);
    }
    chunks
}

fn transport_error(e: reqwest::Error) -> BusError {
    BusError::transient(format!("request failed: {}", e)).with_source(e)
}

async fn status_error(response: reqwest::Response) -> BusError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    BusError::from_status(status, body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_uses_plain_http_without_token() {
        let config = PubSubConfig::emulator("local", "localhost:8085/");
        assert_eq!(config.endpoint, "http://localhost:8085");
        assert!(config.token.is_none());
        assert_eq!(
            config.topic_url("events"),
            "http://localhost:8085/v1/projects/local/topics/events"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let config = PubSubConfig::new("prod", Some("secret-token".to_string()));
        let printed = format!("{:?}", config);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn publish_request_encodes_data_as_base64() {
        let attributes = BTreeMap::from([("type".to_string(), "x".to_string())]);
        let body = PublishRequest {
            messages: vec![PubsubMessage {
                data: BASE64.encode(b"hello"),
                attributes: &attributes,
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["data"], "aGVsbG8=");
        assert_eq!(json["messages"][0]["attributes"]["type"], "x");
    }

    fn message(data_len: usize) -> BusMessage {
        BusMessage {
            data: vec![b'x'; data_len],
            attributes: BTreeMap::from([("id".to_string(), "e".to_string())]),
        }
    }

    #[test]
    fn small_batch_is_one_request() {
        let messages: Vec<_> = (0..10).map(|_| message(100)).collect();
        let chunks = request_chunks(&messages);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 10);
        assert!(request_chunks(&[]).is_empty());
    }

    #[test]
    fn oversized_count_is_split_in_order() {
        let messages: Vec<_> = (0..2500)
            .map(|i| BusMessage {
                data: i.to_string().into_bytes(),
                attributes: BTreeMap::new(),
            })
            .collect();
        let chunks = request_chunks(&messages);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let rejoined: Vec<_> = chunks.concat();
        assert_eq!(rejoined, messages);
    }

    #[test]
    fn oversized_bytes_are_split_under_budget() {
        // Each message encodes to about 4 MB, so two fit per request.
        let messages: Vec<_> = (0..5).map(|_| message(3_000_000)).collect();
        let chunks = request_chunks(&messages);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        for chunk in &chunks {
            let total: usize = chunk.iter().map(encoded_size).sum();
            assert!(total <= MAX_REQUEST_BYTES);
        }
    }

    #[test]
    fn single_huge_message_gets_its_own_request() {
        let messages = vec![message(10), message(20_000_000), message(10)];
        let sizes: Vec<_> = request_chunks(&messages).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }

    #[test]
    fn encoded_size_covers_serialized_request() {
        let m = message(1234);
        let body = PublishRequest {
            messages: vec![PubsubMessage {
                data: BASE64.encode(&m.data),
                attributes: &m.attributes,
            }],
        };
        let json = serde_json::to_vec(&body).unwrap();
        assert!(json.len() <= encoded_size(&m) + 16);
    }

    #[test]
    fn publish_response_parses_message_ids() {
        let parsed: PublishResponse =
            serde_json::from_str(r#"{"messageIds":["1","2"]}"#).unwrap();
        assert_eq!(parsed.message_ids, vec!["1", "2"]);
    }
}
