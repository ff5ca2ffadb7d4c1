//! Incremental collection from sources that only offer paginated listings.
//!
//! Each cycle enumerates the keys of every configured group and, per key,
//! emits the items newer than the key's cursor (bounded by a cutoff window),
//! then advances the cursor to the newest item listed. Keys are collected
//! concurrently; one key failing never affects another, and never stops the
//! next cycle.
//!
//! Delivery is at-least-once: a key whose cycle is abandoned keeps its old
//! cursor and is re-emitted from there next time.

pub mod config;
pub mod cycle;
pub mod feed;
pub mod github;
mod incremental;
pub mod rate_limit;

#[cfg(test)]
mod tests;

pub use config::{CollectorConfig, EmitOrder};
pub use cycle::{CycleState, ScanStop};
pub use feed::{ActivityFeed, FeedError, FeedItem, Page, PageToken};
pub use github::GitHubFeed;
pub use incremental::{CycleReport, IncrementalCollector, KeyError, KeyReport};
pub use rate_limit::{RateLimitError, RateLimiter};
