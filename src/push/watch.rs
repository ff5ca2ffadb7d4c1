//! Subscriptions to push-style streams, and a [`Source`] built on them.
//!
//! [`subscribe`] drives a stream on its own task and hands each item to a
//! callback. The returned [`SubscriptionHandle`] ends the subscription when
//! it is cancelled or dropped, so a subscription can never outlive its
//! owner.
//!
//! [`WatchSource`] turns a [`WatchFeed`] into a pipeline source: it opens the
//! watch, converts each item, offers it to the queue without waiting, and
//! reopens the watch when the server ends it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::deliver;
use crate::pipeline::{EventSink, RunningSource, Source, SourceError};
use crate::types::{ConversionError, NormalizedEvent};

/// Default pause before reopening a watch that ended or failed to open.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Errors from opening or reading a watch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("watch rejected (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    #[error("undecodable watch line: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("watch line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("invalid watch configuration: {0}")]
    Config(String),
}

/// Ends its subscription when cancelled or dropped.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Waits until the subscription has ended, either because the stream
    /// finished or because it was cancelled.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                warn!(error = %e, "Subscription task failed");
            }
            self.task = None;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Calls `on_item` for every item of `stream` until the stream ends or the
/// returned handle is cancelled or dropped.
pub fn subscribe<S, F>(stream: S, mut on_item: F) -> SubscriptionHandle
where
    S: futures::Stream + Send + 'static,
    S::Item: Send,
    F: FnMut(S::Item) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => match item {
                    Some(item) => on_item(item),
                    None => break,
                },
            }
        }
    });

    SubscriptionHandle {
        cancel,
        task: Some(task),
    }
}

/// A server-pushed stream of native items.
pub trait WatchFeed: Send + Sync + 'static {
    type Item: Send + 'static;

    fn name(&self) -> &str;

    /// Opens a watch. The stream ends when the server closes it.
    fn watch(
        &self,
    ) -> impl Future<Output = Result<BoxStream<'static, Result<Self::Item, WatchError>>, WatchError>>
    + Send;

    /// Converts one item; `Ok(None)` filters it out.
    fn convert(&self, item: Self::Item) -> Result<Option<NormalizedEvent>, ConversionError>;
}

/// Counters for one [`WatchSource`].
#[derive(Debug, Default)]
struct WatchStats {
    forwarded: std::sync::atomic::AtomicU64,
}

/// Pipeline source over a [`WatchFeed`].
pub struct WatchSource<W> {
    feed: Arc<W>,
    reconnect_delay: Duration,
    stats: Arc<WatchStats>,
}

impl<W: WatchFeed> WatchSource<W> {
    pub fn new(feed: W) -> Self {
        WatchSource {
            feed: Arc::new(feed),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stats: Arc::default(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Watches until `stop` fires, reopening the watch whenever it ends.
    #[instrument(skip_all, fields(source = %self.feed.name()))]
    pub async fn run(&self, sink: EventSink, stop: CancellationToken) {
        info!("Watch source started");

        loop {
            let opened = tokio::select! {
                _ = stop.cancelled() => break,
                opened = self.feed.watch() => opened,
            };

            match opened {
                Ok(stream) => {
                    debug!("Watch opened");
                    let mut subscription = self.forward(stream, sink.clone());
                    tokio::select! {
                        _ = stop.cancelled() => {
                            subscription.cancel();
                            subscription.finished().await;
                            break;
                        }
                        _ = subscription.finished() => {
                            debug!("Watch ended by server");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to open watch"),
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!(
            forwarded = self.stats.forwarded.load(std::sync::atomic::Ordering::Relaxed),
            "Watch source stopped"
        );
    }

    fn forward(
        &self,
        stream: BoxStream<'static, Result<W::Item, WatchError>>,
        sink: EventSink,
    ) -> SubscriptionHandle {
        let feed = Arc::clone(&self.feed);
        let stats = Arc::clone(&self.stats);

        subscribe(stream, move |item| {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Watch stream error");
                    return;
                }
            };
            match feed.convert(item) {
                Ok(Some(event)) => {
                    if deliver(&sink, event).is_ok() {
                        stats
                            .forwarded
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to convert watch item, skipping"),
            }
        })
    }
}

impl<W: WatchFeed> Source for WatchSource<W> {
    fn name(&self) -> &str {
        self.feed.name()
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
