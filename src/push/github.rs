//! GitHub webhook deliveries.

use chrono::{DateTime, Utc};

use super::generated_id;
use crate::types::{ConversionError, NormalizedEvent};

/// The parts of a webhook request the conversion needs. Signature checks
/// happen before this is built.
#[derive(Debug, Clone, Copy)]
pub struct GitHubDelivery<'a> {
    /// Value of `X-GitHub-Event`.
    pub event: &'a str,
    /// Value of `X-GitHub-Delivery`, if sent.
    pub delivery_id: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Converts one delivery.
///
/// The body must be JSON. The repository is taken from
/// `repository.full_name` when present; events without a repository (e.g.
/// `ping` on an organisation hook) get an empty path in their source.
pub fn convert_github_webhook(
    delivery: &GitHubDelivery<'_>,
    received_at: DateTime<Utc>,
) -> Result<NormalizedEvent, ConversionError> {
    if delivery.event.is_empty() {
        return Err(ConversionError::MissingField("X-GitHub-Event"));
    }

    let body: serde_json::Value = serde_json::from_slice(delivery.body)?;
    let repository = body
        .pointer("/repository/full_name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let id = match delivery.delivery_id.filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => generated_id("gh_", received_at),
    };

    Ok(NormalizedEvent::new(
        id.clone(),
        format!("github.com/{}", repository),
        format!("github.{}", delivery.event),
        received_at,
        delivery.body.to_vec(),
    )
    .with_attribute("delivery_id", id)
    .with_attribute("event_type", delivery.event)
    .with_attribute("repository", repository)
    .with_attribute("user_agent", delivery.user_agent.unwrap_or_default())
    .with_attribute("content_type", delivery.content_type.unwrap_or_default()))
}
