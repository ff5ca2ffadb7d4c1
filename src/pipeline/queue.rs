//! Bounded fan-in queue between producers and the batch publisher.
//!
//! Every source writes [`NormalizedEvent`]s through a cloned [`EventSink`];
//! the publisher is the single [`QueueReceiver`]. FIFO order is preserved
//! among enqueued items only, so there is no ordering across producers.
//!
//! # Admission
//!
//! How a producer behaves on a full queue is an explicit [`Admission`]
//! parameter rather than a property of the code path:
//!
//! - [`Admission::DropWhenFull`]: one non-blocking attempt. Push adapters use
//!   this and surface the failure to their caller as backpressure.
//! - [`Admission::WaitUpTo`]: waits for capacity for at most the given
//!   duration and aborts on cancellation. The incremental collector uses this.
//!
//! # Closing
//!
//! [`EventSink::close`] is called once, after every producer has stopped.
//! From then on new submissions fail with [`EnqueueError::Closed`] and the
//! receiver yields the buffered remainder before returning `None`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::NormalizedEvent;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Admission policy applied when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Fail immediately and drop the event.
    DropWhenFull,

    /// Wait for capacity up to the given duration, then drop the event.
    WaitUpTo(Duration),
}

/// Reasons an enqueue attempt can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue was full and the admission policy does not wait.
    #[error("queue full")]
    Full,

    /// No capacity became available within the allowed wait.
    #[error("queue full after waiting {0:?}")]
    TimedOut(Duration),

    /// The queue has been closed for shutdown.
    #[error("queue closed")]
    Closed,

    /// The producer was cancelled while waiting for capacity.
    #[error("enqueue cancelled")]
    Cancelled,
}

impl EnqueueError {
    /// Returns true for failures caused by a saturated queue.
    ///
    /// Callers translate these into a retryable "busy" signal.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, EnqueueError::Full | EnqueueError::TimedOut(_))
    }
}

#[derive(Debug, Default)]
struct Shared {
    closed: CancellationToken,
    close_called: AtomicBool,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

/// Creates a fan-in queue with the given capacity.
///
/// A capacity of zero is raised to one.
pub fn fan_in(capacity: usize) -> (EventSink, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        EventSink {
            tx,
            shared: Arc::clone(&shared),
        },
        QueueReceiver {
            rx,
            shared,
            draining: false,
        },
    )
}

/// Producer handle for the fan-in queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<NormalizedEvent>,
    shared: Arc<Shared>,
}

impl EventSink {
    /// Attempts a single non-blocking enqueue.
    pub fn offer(&self, event: NormalizedEvent) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.shared.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event_id = %event.id, "Queue full, dropping event");
                Err(EnqueueError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Enqueues under the given admission policy.
    ///
    /// With [`Admission::WaitUpTo`] this suspends until capacity is available,
    /// the wait elapses, the queue closes, or `cancel` fires, whichever comes
    /// first.
    pub async fn submit(
        &self,
        event: NormalizedEvent,
        admission: Admission,
        cancel: &CancellationToken,
    ) -> Result<(), EnqueueError> {
        let wait = match admission {
            Admission::DropWhenFull => return self.offer(event),
            Admission::WaitUpTo(wait) => wait,
        };

        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(EnqueueError::Cancelled),
            _ = self.shared.closed.cancelled() => Err(EnqueueError::Closed),
            sent = tokio::time::timeout(wait, self.tx.send(event)) => match sent {
                Ok(Ok(())) => {
                    self.shared.accepted.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Ok(Err(_)) => Err(EnqueueError::Closed),
                Err(_) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(EnqueueError::TimedOut(wait))
                }
            },
        }
    }

    /// Closes the queue. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.shared.close_called.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(buffered = self.len(), "Closing fan-in queue");
        self.shared.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Total events accepted since creation.
    pub fn accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Total events rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// The single consumer end of the fan-in queue.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<NormalizedEvent>,
    shared: Arc<Shared>,
    draining: bool,
}

impl QueueReceiver {
    /// Receives the next event.
    ///
    /// Returns `None` once the queue is closed (or every sink is dropped) and
    /// all buffered events have been yielded. Cancel safe.
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        if !self.draining {
            tokio::select! {
                biased;
                event = self.rx.recv() => return event,
                _ = self.shared.closed.cancelled() => {
                    self.rx.close();
                    self.draining = true;
                }
            }
        }
        self.rx.recv().await
    }

    /// True once the receiver has observed the close signal.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
