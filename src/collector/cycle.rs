//! Per-key collection state and the newest-first scan.
//!
//! A cycle for one key sees the listing one page at a time. [`CycleState`]
//! decides, item by item, whether the item is new:
//!
//! - the item equal to the previous cursor marks the end of new items
//! - anything after that marker is already processed
//! - before the marker, an item older than the cutoff ends the scan, which
//!   bounds backfill on a first run or after long downtime
//! - everything else is new
//!
//! The first item of the first page becomes the next cursor, no matter how
//! much of the listing turns out to be new.

use chrono::{DateTime, Utc};

use super::feed::FeedItem;
use crate::types::CursorToken;

/// Why the scan of a key ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// The listing ran out before either marker was reached.
    Exhausted,
    /// The previous cursor was found.
    PreviousCursor,
    /// An item older than the cutoff was reached.
    Cutoff,
}

/// Ephemeral state for one key during one cycle.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub cutoff: DateTime<Utc>,
    pub previous: CursorToken,
    pub latest_observed: Option<String>,
    pub found_previous: bool,
    stopped_at_cutoff: bool,
}

impl CycleState {
    pub fn new(previous: CursorToken, cutoff: DateTime<Utc>) -> Self {
        CycleState {
            cutoff,
            previous,
            latest_observed: None,
            found_previous: false,
            stopped_at_cutoff: false,
        }
    }

    /// True once nothing further in the listing can be new.
    pub fn is_done(&self) -> bool {
        self.found_previous || self.stopped_at_cutoff
    }

    pub fn stop_reason(&self) -> ScanStop {
        if self.found_previous {
            ScanStop::PreviousCursor
        } else if self.stopped_at_cutoff {
            ScanStop::Cutoff
        } else {
            ScanStop::Exhausted
        }
    }

    /// Scans one page (newest first) and returns its new items in scan
    /// order.
    pub fn scan_page(&mut self, items: Vec<FeedItem>) -> Vec<FeedItem> {
        if self.latest_observed.is_none()
            && let Some(first) = items.first()
        {
            self.latest_observed = Some(first.id.clone());
        }

        let mut fresh = Vec::new();
        for item in items {
            if self.stopped_at_cutoff {
                break;
            }
            if self.previous.matches(&item.id) {
                self.found_previous = true;
                continue;
            }
            if self.found_previous {
                continue;
            }
            if item.created_at < self.cutoff {
                self.stopped_at_cutoff = true;
                break;
            }
            fresh.push(item);
        }
        fresh
    }

    /// The cursor to store once the scan is complete, if anything was listed.
    pub fn next_cursor(&self) -> Option<CursorToken> {
        self.latest_observed.as_deref().map(CursorToken::new)
    }
}
