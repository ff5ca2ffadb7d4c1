//! The paginated listing interface the collector polls.

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::rate_limit::RateLimitError;
use crate::types::{ConversionError, NormalizedEvent, RepoId};

/// Opaque continuation token returned by a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(pub String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        PageToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a listing. `next` is `None` on the terminal page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Page { items, next: None }
    }
}

/// One listed item: the ID that cursors compare against, its timestamp, and
/// the raw source document.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Errors from a listing call. Any of these aborts the current key.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("GitHub API error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("invalid page token {0:?}")]
    InvalidPageToken(String),

    #[error("listing failed: {0}")]
    Listing(String),
}

/// A source with no streaming API, exposed as paginated listings.
///
/// Listings are newest first. Keys are enumerated per group.
pub trait ActivityFeed: Send + Sync {
    /// Lists the keys (repositories) belonging to `group`.
    fn list_keys(
        &self,
        group: &str,
        page: Option<PageToken>,
    ) -> impl Future<Output = Result<Page<RepoId>, FeedError>> + Send;

    /// Lists one page of items for `key`, newest first.
    fn list_page(
        &self,
        key: &RepoId,
        page: Option<PageToken>,
    ) -> impl Future<Output = Result<Page<FeedItem>, FeedError>> + Send;

    /// Normalizes one listed item.
    fn convert(
        &self,
        group: &str,
        key: &RepoId,
        item: &FeedItem,
    ) -> Result<NormalizedEvent, ConversionError>;
}
