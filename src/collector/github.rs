//! GitHub repository events as an [`ActivityFeed`].
//!
//! The events API has no streaming mode, so repositories are listed per
//! organisation and each repository's event listing is polled. Events are
//! fetched as raw JSON so that payload types octocrab does not model still
//! pass through untouched.

use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::feed::{ActivityFeed, FeedError, FeedItem, Page, PageToken};
use crate::types::{ConversionError, NormalizedEvent, RepoId};

/// Page size for every listing call (the API maximum).
const PER_PAGE: u8 = 100;

#[derive(Serialize)]
struct ListParams {
    per_page: u8,
    page: u32,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

/// The two fields every listed event must have.
#[derive(Deserialize)]
struct EventHeader {
    id: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Polls GitHub through octocrab.
#[derive(Clone)]
pub struct GitHubFeed {
    client: Octocrab,
}

impl GitHubFeed {
    pub fn new(client: Octocrab) -> Self {
        GitHubFeed { client }
    }

    /// Creates a feed authenticated with a personal access token, or an
    /// anonymous one when no token is given.
    pub fn from_token(token: Option<String>) -> Result<Self, octocrab::Error> {
        let builder = Octocrab::builder();
        let client = match token {
            Some(token) => builder.personal_token(token).build()?,
            None => builder.build()?,
        };
        Ok(Self::new(client))
    }

    async fn get_page<T>(
        &self,
        route: &str,
        kind: Option<&'static str>,
        page: Option<PageToken>,
    ) -> Result<(octocrab::Page<T>, u32), FeedError>
    where
        T: serde::de::DeserializeOwned,
    {
        let page_number = page_number(page.as_ref())?;
        let params = ListParams {
            per_page: PER_PAGE,
            page: page_number,
            kind,
        };
        let response = self
            .client
            .get::<octocrab::Page<T>, _, _>(route, Some(&params))
            .await?;
        Ok((response, page_number))
    }
}

impl std::fmt::Debug for GitHubFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubFeed").finish_non_exhaustive()
    }
}

/// Page tokens are 1-based page numbers; no token means the first page.
fn page_number(token: Option<&PageToken>) -> Result<u32, FeedError> {
    match token {
        None => Ok(1),
        Some(token) => token
            .as_str()
            .parse::<u32>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| FeedError::InvalidPageToken(token.as_str().to_string())),
    }
}

fn next_token(has_next: bool, current: u32) -> Option<PageToken> {
    has_next.then(|| PageToken::new((current + 1).to_string()))
}

/// Extracts the cursor fields from a raw event, or `None` if they are
/// missing.
fn feed_item(raw: serde_json::Value) -> Option<FeedItem> {
    let header: EventHeader = serde_json::from_value(raw.clone()).ok()?;
    Some(FeedItem {
        id: header.id,
        created_at: header.created_at,
        raw,
    })
}

impl ActivityFeed for GitHubFeed {
    async fn list_keys(
        &self,
        group: &str,
        page: Option<PageToken>,
    ) -> Result<Page<RepoId>, FeedError> {
        let route = format!("/orgs/{}/repos", group);
        let (response, current) = self
            .get_page::<octocrab::models::Repository>(&route, Some("all"), page)
            .await?;

        Ok(Page {
            items: response
                .items
                .into_iter()
                .map(|repo| RepoId::new(group, repo.name))
                .collect(),
            next: next_token(response.next.is_some(), current),
        })
    }

    async fn list_page(
        &self,
        key: &RepoId,
        page: Option<PageToken>,
    ) -> Result<Page<FeedItem>, FeedError> {
        let route = format!("/repos/{}/{}/events", key.owner, key.repo);
        let (response, current) = self
            .get_page::<serde_json::Value>(&route, None, page)
            .await?;

        let mut items = Vec::with_capacity(response.items.len());
        for raw in response.items {
            match feed_item(raw) {
                Some(item) => items.push(item),
                None => warn!(key = %key, "Listed event has no id or created_at, ignoring"),
            }
        }

        Ok(Page {
            items,
            next: next_token(response.next.is_some(), current),
        })
    }

    fn convert(
        &self,
        group: &str,
        key: &RepoId,
        item: &FeedItem,
    ) -> Result<NormalizedEvent, ConversionError> {
        convert_repo_event(group, key, item)
    }
}

/// Normalizes one raw repository event.
///
/// Type is `github.<EventType>`, source is `//github.com/<org>/<repo>`, and
/// the subject is the actor's login.
pub fn convert_repo_event(
    group: &str,
    key: &RepoId,
    item: &FeedItem,
) -> Result<NormalizedEvent, ConversionError> {
    let raw_type = item
        .raw
        .get("type")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .ok_or(ConversionError::MissingField("type"))?;
    let actor = item
        .raw
        .pointer("/actor/login")
        .and_then(|a| a.as_str())
        .unwrap_or_default();
    let payload = match item.raw.get("payload") {
        Some(payload) => serde_json::to_vec(payload)?,
        None => b"{}".to_vec(),
    };

    Ok(NormalizedEvent::new(
        item.id.clone(),
        format!("//github.com/{}/{}", group, key.repo),
        format!("github.{}", raw_type),
        item.created_at,
        payload,
    )
    .with_subject(actor)
    .with_attribute("org", group)
    .with_attribute("repo", key.repo.clone())
    .with_attribute("actor", actor)
    .with_attribute("raw_type", raw_type))
}
