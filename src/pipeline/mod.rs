//! The forwarding pipeline: sources → fan-in queue → batch publisher → bus.
//!
//! Every producer implements [`Source`]. [`Pipeline::start`] starts the
//! sources and then the publisher; [`RunningPipeline::shutdown`] tears them
//! down in the only order that loses no buffered events:
//!
//! 1. stop every source and wait for it to exit
//! 2. close the fan-in queue
//! 3. wait for the publisher to drain the queue and flush its last batch
//! 4. the publisher closes the bus

pub mod batch;
pub mod bus;
pub mod publisher;
pub mod queue;
pub mod retry;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use batch::{BatchLimits, FlushReason};
pub use bus::{BusError, BusErrorKind, BusMessage, MessageBus};
pub use publisher::{BatchPublisher, DrainReport, PublisherConfig};
pub use queue::{Admission, DEFAULT_QUEUE_CAPACITY, EnqueueError, EventSink, QueueReceiver, fan_in};
pub use retry::RetryConfig;

/// Errors raised while starting a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("source {name} failed to start: {message}")]
    Startup { name: String, message: String },
}

/// A producer of normalized events.
///
/// Implementations own whatever connection they need and write into the
/// given [`EventSink`] until the token passed to `start` (or the returned
/// handle's [`RunningSource::stop`]) cancels them.
pub trait Source: Send {
    fn name(&self) -> &str;

    /// Starts producing. Errors here are startup errors and abort the
    /// pipeline start.
    fn start(
        self: Box<Self>,
        sink: EventSink,
        shutdown: CancellationToken,
    ) -> Result<RunningSource, SourceError>;
}

/// Handle to a started [`Source`].
#[derive(Debug)]
pub struct RunningSource {
    name: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningSource {
    /// Spawns `body` with a child of `shutdown` as its stop token.
    pub fn spawn<F, Fut>(name: impl Into<String>, shutdown: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = shutdown.child_token();
        let task = tokio::spawn(body(stop.clone()));
        RunningSource {
            name: name.into(),
            stop,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the source to stop and waits until it has exited.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!(source = %self.name, error = %e, "Source task failed");
        } else {
            info!(source = %self.name, "Source stopped");
        }
    }
}

/// Sources, queue settings and publisher settings, ready to start.
pub struct Pipeline<B> {
    bus: Arc<B>,
    queue_capacity: usize,
    publisher: PublisherConfig,
    sources: Vec<Box<dyn Source>>,
}

impl<B: MessageBus + 'static> Pipeline<B> {
    pub fn new(bus: Arc<B>, publisher: PublisherConfig) -> Self {
        Pipeline {
            bus,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publisher,
            sources: Vec::new(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_source(mut self, source: impl Source + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Starts every source, then the publisher.
    ///
    /// If a source fails to start, the sources already started are stopped
    /// and the error is returned; the publisher is never started.
    pub async fn start(self, shutdown: &CancellationToken) -> Result<RunningPipeline, SourceError> {
        let (sink, receiver) = fan_in(self.queue_capacity);

        let mut running = Vec::with_capacity(self.sources.len());
        for source in self.sources {
            let name = source.name().to_string();
            match source.start(sink.clone(), shutdown.clone()) {
                Ok(handle) => {
                    info!(source = %name, "Source started");
                    running.push(handle);
                }
                Err(e) => {
                    error!(source = %name, error = %e, "Source failed to start");
                    for handle in running {
                        handle.stop().await;
                    }
                    sink.close();
                    return Err(e);
                }
            }
        }

        let publisher =
            BatchPublisher::new(self.bus, self.publisher).with_cancellation(shutdown.clone());
        let publisher = tokio::spawn(publisher.run(receiver));

        info!(sources = running.len(), capacity = sink.capacity(), "Pipeline started");
        Ok(RunningPipeline {
            sink,
            sources: running,
            publisher,
        })
    }
}

/// A started pipeline. Call [`RunningPipeline::shutdown`] to drain it.
#[derive(Debug)]
pub struct RunningPipeline {
    sink: EventSink,
    sources: Vec<RunningSource>,
    publisher: JoinHandle<DrainReport>,
}

impl RunningPipeline {
    /// A producer handle onto the pipeline's queue.
    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Stops sources, closes the queue and waits for the publisher to drain.
    pub async fn shutdown(self) -> DrainReport {
        info!(sources = self.sources.len(), "Stopping sources");
        for source in self.sources {
            source.stop().await;
        }

        self.sink.close();

        let mut report = match self.publisher.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Publisher task failed");
                DrainReport::default()
            }
        };
        report.events_dropped = self.sink.dropped();
        if report.events_dropped > 0 {
            warn!(dropped = report.events_dropped, "Events were dropped on a full queue");
        }

        info!(
            published = report.events_published,
            failed = report.events_failed,
            dropped = report.events_dropped,
            "Pipeline stopped"
        );
        report
    }
}
