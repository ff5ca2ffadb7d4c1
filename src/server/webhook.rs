//! Webhook endpoint handlers.
//!
//! Each handler verifies the signature (when a secret is configured) before
//! looking at the body, converts the delivery, and offers the event to the
//! queue once. Nothing is buffered here: if the queue is full the sender is
//! told to retry.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::pipeline::EnqueueError;
use crate::push::{self, GitHubDelivery, convert_github_webhook, convert_terraform_notification};
use crate::types::ConversionError;
use crate::webhooks::{verify_signature, verify_tfc_signature};

const HEADER_GITHUB_EVENT: &str = "x-github-event";
const HEADER_GITHUB_DELIVERY: &str = "x-github-delivery";
const HEADER_GITHUB_SIGNATURE: &str = "x-hub-signature-256";
const HEADER_TFC_SIGNATURE: &str = "x-tfe-notification-signature";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ConversionError),

    #[error("event not accepted: {0}")]
    Unavailable(#[from] EnqueueError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            // Full, or closed because we are shutting down. Either way the
            // sender should retry.
            WebhookError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, self.to_string()).into_response()
    }
}

/// GitHub webhook handler.
///
/// - 202 Accepted: event enqueued
/// - 400 Bad Request: missing `X-GitHub-Event` or a non-JSON body
/// - 401 Unauthorized: signature missing or wrong while a secret is set
/// - 503 Service Unavailable: queue full or shutting down
pub async fn github_webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let event = get_header(&headers, HEADER_GITHUB_EVENT)
        .ok_or(WebhookError::MissingHeader(HEADER_GITHUB_EVENT))?;
    let delivery_id = get_header(&headers, HEADER_GITHUB_DELIVERY);

    debug!(event, delivery_id, "Received GitHub webhook");

    let secret = app_state.github_secret();
    if !secret.is_empty() {
        let signature = get_header(&headers, HEADER_GITHUB_SIGNATURE).unwrap_or_default();
        if !verify_signature(&body, signature, secret) {
            warn!(delivery_id, "Invalid GitHub webhook signature");
            return Err(WebhookError::InvalidSignature);
        }
    }

    let delivery = GitHubDelivery {
        event,
        delivery_id,
        user_agent: get_header(&headers, header::USER_AGENT.as_str()),
        content_type: get_header(&headers, header::CONTENT_TYPE.as_str()),
        body: &body,
    };
    let event = convert_github_webhook(&delivery, Utc::now())?;
    let (id, source) = (event.id.clone(), event.source.clone());

    push::deliver(app_state.sink(), event)?;
    info!(event_id = %id, source = %source, "GitHub webhook accepted");
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Terraform Cloud notification handler.
///
/// With a secret configured, a missing signature header is a 400 and a
/// wrong one a 401.
pub async fn terraform_webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let secret = app_state.tfc_secret();
    if !secret.is_empty() {
        let signature = get_header(&headers, HEADER_TFC_SIGNATURE)
            .ok_or(WebhookError::MissingHeader(HEADER_TFC_SIGNATURE))?;
        if !verify_tfc_signature(&body, signature, secret) {
            warn!("Invalid Terraform Cloud notification signature");
            return Err(WebhookError::InvalidSignature);
        }
    }

    let event = convert_terraform_notification(&body, Utc::now())?;
    let (id, source) = (event.id.clone(), event.source.clone());

    push::deliver(app_state.sink(), event)?;
    info!(event_id = %id, source = %source, "Terraform Cloud notification accepted");
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Returns a header's value, treating non-UTF-8 and empty values as absent.
fn get_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
