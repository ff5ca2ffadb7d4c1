//! The polling loop: one cycle on start, then one per interval.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::{CollectorConfig, EmitOrder};
use super::cycle::{CycleState, ScanStop};
use super::feed::{ActivityFeed, FeedError, PageToken};
use super::rate_limit::{RateLimitError, RateLimiter};
use crate::cursor::CursorStore;
use crate::pipeline::{Admission, EnqueueError, EventSink, RunningSource, Source, SourceError};
use crate::types::RepoId;

/// Reasons a key's cycle was abandoned. The key's cursor is left unchanged.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("enqueue failed: {0}")]
    Enqueue(#[from] EnqueueError),
}

impl From<RateLimitError> for KeyError {
    fn from(e: RateLimitError) -> Self {
        KeyError::Feed(FeedError::RateLimit(e))
    }
}

impl KeyError {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            KeyError::Feed(FeedError::RateLimit(RateLimitError::Cancelled))
                | KeyError::Enqueue(EnqueueError::Cancelled | EnqueueError::Closed)
        )
    }
}

/// Outcome of one key's cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReport {
    pub emitted: usize,
    /// Items that failed conversion and were skipped.
    pub skipped: usize,
    pub stop: ScanStop,
    /// False when the listing was empty and the cursor was left alone.
    pub cursor_advanced: bool,
}

/// Totals for one cycle over every group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub keys: usize,
    pub emitted: usize,
    pub skipped: usize,
    pub failed_keys: usize,
}

/// Turns an [`ActivityFeed`] into a stream of new events.
pub struct IncrementalCollector<F> {
    feed: Arc<F>,
    cursors: Arc<CursorStore>,
    limiter: RateLimiter,
    config: CollectorConfig,
}

impl<F: ActivityFeed + 'static> IncrementalCollector<F> {
    pub fn new(feed: Arc<F>, cursors: Arc<CursorStore>, config: CollectorConfig) -> Self {
        IncrementalCollector {
            feed,
            cursors,
            limiter: RateLimiter::new(config.rate_per_sec, config.burst),
            config,
        }
    }

    pub fn cursors(&self) -> &Arc<CursorStore> {
        &self.cursors
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Runs cycles until `cancel` fires.
    #[instrument(skip_all, fields(groups = ?self.config.groups))]
    pub async fn run(&self, sink: EventSink, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Incremental collector started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping collector");
                    break;
                }

                _ = ticker.tick() => {
                    let report = self.run_cycle(&sink, &cancel).await;
                    info!(
                        keys = report.keys,
                        emitted = report.emitted,
                        skipped = report.skipped,
                        failed_keys = report.failed_keys,
                        "Collection cycle finished"
                    );
                }
            }
        }
    }

    /// Runs one cycle over every configured group.
    pub async fn run_cycle(&self, sink: &EventSink, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        for group in &self.config.groups {
            if cancel.is_cancelled() {
                break;
            }

            let keys = match self.list_keys(group, cancel).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(group = %group, error = %e, "Failed to list keys");
                    continue;
                }
            };

            let permits = Semaphore::new(self.config.concurrency.max(1));
            let pending: Vec<_> = keys
                .into_iter()
                .map(|key| self.collect_key_with_permit(&permits, group, key, sink, cancel))
                .collect();
            let results = futures::future::join_all(pending).await;

            for (key, result) in results {
                report.keys += 1;
                match result {
                    Ok(key_report) => {
                        report.emitted += key_report.emitted;
                        report.skipped += key_report.skipped;
                    }
                    Err(e) if e.is_cancelled() => {
                        debug!(key = %key, "Key collection cancelled");
                        report.failed_keys += 1;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Key collection aborted");
                        report.failed_keys += 1;
                    }
                }
            }
        }

        report
    }

    async fn collect_key_with_permit(
        &self,
        permits: &Semaphore,
        group: &str,
        key: RepoId,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> (RepoId, Result<KeyReport, KeyError>) {
        // The semaphore is never closed.
        let _permit = permits.acquire().await.ok();
        let result = self.collect_key(group, &key, sink, cancel).await;
        (key, result)
    }

    /// Enumerates every allowed key of `group`.
    async fn list_keys(
        &self,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RepoId>, FeedError> {
        let mut keys = Vec::new();
        let mut token: Option<PageToken> = None;

        loop {
            self.limiter.wait(cancel).await?;
            let page = self.feed.list_keys(group, token).await?;
            keys.extend(page.items.into_iter().filter(|k| self.config.is_allowed(k)));
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(group, keys = keys.len(), "Listed keys");
        Ok(keys)
    }

    /// Collects one key: walk, scan, convert, enqueue, then advance the
    /// cursor.
    ///
    /// Nothing is enqueued until the walk has finished, so a listing error
    /// never leaves a partially emitted key behind. Pages are fetched only
    /// until the scan reaches the previous cursor or the cutoff.
    #[instrument(skip(self, key, sink, cancel), fields(key = %key))]
    pub async fn collect_key(
        &self,
        group: &str,
        key: &RepoId,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<KeyReport, KeyError> {
        let cursor_key = key.full_name();
        let previous = self.cursors.get(&cursor_key);
        let cutoff = TimeDelta::from_std(self.config.cutoff)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = CycleState::new(previous, cutoff);

        let mut fresh = Vec::new();
        let mut token: Option<PageToken> = None;
        loop {
            self.limiter.wait(cancel).await?;
            let page = self.feed.list_page(key, token).await?;
            if page.items.is_empty() {
                break;
            }
            fresh.extend(state.scan_page(page.items));
            if state.is_done() {
                break;
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let Some(next_cursor) = state.next_cursor() else {
            debug!("Empty listing");
            return Ok(KeyReport {
                emitted: 0,
                skipped: 0,
                stop: ScanStop::Exhausted,
                cursor_advanced: false,
            });
        };

        debug!(
            new = fresh.len(),
            previous = %state.previous,
            latest = %next_cursor,
            stop = ?state.stop_reason(),
            "Scanned listing"
        );

        if self.config.emit_order == EmitOrder::OldestFirst {
            fresh.reverse();
        }

        let admission = Admission::WaitUpTo(self.config.enqueue_timeout);
        let mut emitted = 0;
        let mut skipped = 0;
        for item in &fresh {
            let event = match self.feed.convert(group, key, item) {
                Ok(event) => event,
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "Failed to convert item, skipping");
                    skipped += 1;
                    continue;
                }
            };
            sink.submit(event, admission, cancel).await?;
            emitted += 1;
        }

        self.cursors.set(&cursor_key, next_cursor);

        Ok(KeyReport {
            emitted,
            skipped,
            stop: state.stop_reason(),
            cursor_advanced: true,
        })
    }
}

impl<F: ActivityFeed + 'static> Source for IncrementalCollector<F> {
    fn name(&self) -> &str {
        "github"
    }

    fn start(
        self: Box<Self>,
        sink: EventSink,
        shutdown: CancellationToken,
    ) -> Result<RunningSource, SourceError> {
        let name = self.name().to_string();
        Ok(RunningSource::spawn(name, &shutdown, move |stop| async move {
            self.run(sink, stop).await;
        }))
    }
}
