//! The single consumer of the fan-in queue.
//!
//! The publisher groups events into batches and delivers each batch to the
//! message bus. A batch is flushed as soon as any one of three thresholds is
//! reached:
//!
//! - event count ([`BatchLimits::max_events`])
//! - cumulative payload bytes ([`BatchLimits::max_bytes`])
//! - time since the batch's first event ([`BatchLimits::max_linger`])
//!
//! # Failure handling
//!
//! A failed batch is retried as a whole according to [`RetryConfig`], then
//! logged and discarded. The next batch is not started until the current one
//! has succeeded or been discarded, so retries never reorder delivery.
//!
//! # Shutdown
//!
//! The publisher does not stop on cancellation. It runs until the queue is
//! closed and empty, flushes the partial batch, and only then closes the bus.
//! Cancellation only cuts retry backoff short, so a failing bus cannot hold
//! up shutdown.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::batch::{Batch, BatchLimits, FlushReason};
use super::bus::{BusMessage, MessageBus};
use super::queue::QueueReceiver;
use super::retry::{RetryConfig, retry_with_backoff};

/// Settings for a [`BatchPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    pub limits: BatchLimits,
    pub retry: RetryConfig,
}

impl PublisherConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        PublisherConfig {
            topic: topic.into(),
            limits: BatchLimits::default(),
            retry: RetryConfig::DEFAULT,
        }
    }
}

/// Delivery statistics, returned once the publisher has drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Batches handed to the bus, successful or not.
    pub batches: u64,
    pub events_published: u64,
    /// Events discarded after delivery failed or encoding failed.
    pub events_failed: u64,
    /// Events rejected by the queue before reaching the publisher.
    pub events_dropped: u64,
}

/// Drains a [`QueueReceiver`] into a [`MessageBus`] topic.
pub struct BatchPublisher<B> {
    bus: Arc<B>,
    config: PublisherConfig,
    cancel: CancellationToken,
    report: DrainReport,
}

impl<B: MessageBus> BatchPublisher<B> {
    pub fn new(bus: Arc<B>, config: PublisherConfig) -> Self {
        BatchPublisher {
            bus,
            config,
            cancel: CancellationToken::new(),
            report: DrainReport::default(),
        }
    }

    /// Stops retrying failed batches once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs until the queue is closed and drained.
    #[instrument(skip_all, fields(topic = %self.config.topic))]
    pub async fn run(mut self, mut queue: QueueReceiver) -> DrainReport {
        info!(
            max_events = self.config.limits.max_events,
            max_bytes = self.config.limits.max_bytes,
            max_linger_ms = self.config.limits.max_linger.as_millis() as u64,
            "Batch publisher started"
        );

        let mut batch = Batch::new();

        loop {
            let deadline: Option<Instant> = batch.deadline(&self.config.limits);

            tokio::select! {
                event = queue.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(reason) = batch.push(event, &self.config.limits) {
                                self.flush(&mut batch, reason).await;
                            }
                        }
                        None => {
                            debug!("Queue closed and empty");
                            break;
                        }
                    }
                }

                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.flush(&mut batch, FlushReason::Linger).await;
                }
            }
        }

        self.flush(&mut batch, FlushReason::Drain).await;

        if let Err(e) = self.bus.close().await {
            error!(error = %e, "Failed to close message bus");
        }

        info!(
            batches = self.report.batches,
            published = self.report.events_published,
            failed = self.report.events_failed,
            "Batch publisher stopped"
        );
        self.report
    }

    async fn flush(&mut self, batch: &mut Batch, reason: FlushReason) {
        if batch.is_empty() {
            return;
        }
        let bytes = batch.bytes();
        let events = batch.take();

        let mut messages = Vec::with_capacity(events.len());
        for event in &events {
            match BusMessage::from_event(event) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(event_id = %event.id, source = %event.source, error = %e, "Failed to encode event, dropping");
                    self.report.events_failed += 1;
                }
            }
        }
        if messages.is_empty() {
            return;
        }

        let count = messages.len() as u64;
        self.report.batches += 1;
        debug!(%reason, count, bytes, "Flushing batch");

        let bus = &*self.bus;
        let topic = self.config.topic.as_str();
        let batch_messages = &messages;
        let result = retry_with_backoff(self.config.retry, &self.cancel, move || {
            bus.publish_batch(topic, batch_messages)
        })
        .await;

        match result {
            Ok(ids) => {
                self.report.events_published += count;
                debug!(%reason, count, ids = ids.len(), "Batch delivered");
            }
            Err((e, attempts)) => {
                self.report.events_failed += count;
                error!(
                    %reason,
                    count,
                    attempts,
                    error = %e,
                    "Batch delivery failed, discarding batch"
                );
            }
        }
    }
}
