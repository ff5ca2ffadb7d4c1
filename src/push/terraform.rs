//! Terraform Cloud run notifications.
//!
//! A notification payload looks like:
//!
//! ```json
//! {
//!   "payload_version": 1,
//!   "organization_name": "acme",
//!   "workspace_name": "prod",
//!   "run_url": "https://app.terraform.io/app/acme/prod/runs/run-abc",
//!   "notifications": [ ... ]
//! }
//! ```
//!
//! Older payloads nest the workspace under `notification` and the
//! organisation under `organization.name`; both layouts are read.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::generated_id;
use crate::types::{ConversionError, NormalizedEvent};

/// Every Terraform Cloud notification has this type.
pub const TERRAFORM_RUN_TYPE: &str = "com.hashicorp.terraform.run";

#[derive(Debug, Default, Deserialize)]
struct Notification {
    #[serde(default)]
    organization_name: Option<String>,
    #[serde(default)]
    workspace_name: Option<String>,
    #[serde(default)]
    run_url: Option<String>,
    #[serde(default)]
    notification: Option<NestedNotification>,
    #[serde(default)]
    organization: Option<Organization>,
}

#[derive(Debug, Default, Deserialize)]
struct NestedNotification {
    #[serde(default)]
    workspace_name: Option<String>,
    #[serde(default)]
    run_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Organization {
    #[serde(default)]
    name: Option<String>,
}

impl Notification {
    fn organization(&self) -> &str {
        self.organization_name
            .as_deref()
            .or_else(|| self.organization.as_ref()?.name.as_deref())
            .unwrap_or_default()
    }

    fn workspace(&self) -> &str {
        self.workspace_name
            .as_deref()
            .or_else(|| self.notification.as_ref()?.workspace_name.as_deref())
            .unwrap_or_default()
    }

    fn run_url(&self) -> &str {
        self.run_url
            .as_deref()
            .or_else(|| self.notification.as_ref()?.run_url.as_deref())
            .unwrap_or_default()
    }
}

/// Converts one notification body. The id is minted from the receive time.
pub fn convert_terraform_notification(
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<NormalizedEvent, ConversionError> {
    let notification: Notification = serde_json::from_slice(body)?;
    let organization = notification.organization();
    let workspace = notification.workspace();

    Ok(NormalizedEvent::new(
        generated_id("tfc-", received_at),
        format!("app.terraform.io/{}/{}", organization, workspace),
        TERRAFORM_RUN_TYPE,
        received_at,
        body.to_vec(),
    )
    .with_attribute("tfworkspace", workspace)
    .with_attribute("tforganization", organization)
    .with_attribute("tfrunurl", notification.run_url()))
}
