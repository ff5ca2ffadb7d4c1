//! Push adapters: sources that hand us events instead of being polled.
//!
//! Each adapter is a stateless conversion from a validated native payload to
//! one [`NormalizedEvent`]. The converted event gets exactly one non-blocking
//! enqueue attempt through [`deliver`]; a full queue is reported back to the
//! caller (the HTTP layer answers 503) rather than waited on.

pub mod github;
pub mod kubernetes;
pub mod terraform;
pub mod watch;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::pipeline::{EnqueueError, EventSink};
use crate::types::NormalizedEvent;

pub use github::{GitHubDelivery, convert_github_webhook};
pub use kubernetes::{KubeEvent, KubeEventFeed, KubeWatchConfig, convert_kube_event};
pub use terraform::convert_terraform_notification;
pub use watch::{SubscriptionHandle, WatchError, WatchFeed, WatchSource, subscribe};

/// Offers `event` to the queue once, without waiting.
pub fn deliver(sink: &EventSink, event: NormalizedEvent) -> Result<(), EnqueueError> {
    let id = event.id.clone();
    let event_type = event.event_type.clone();
    match sink.offer(event) {
        Ok(()) => {
            debug!(event_id = %id, event_type = %event_type, "Event enqueued");
            Ok(())
        }
        Err(e) => {
            warn!(event_id = %id, event_type = %event_type, error = %e, "Event not enqueued");
            Err(e)
        }
    }
}

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mints an id for payloads that carry none: `<prefix><nanos>-<seq>`.
///
/// The process-wide sequence keeps ids distinct when two deliveries share a
/// timestamp.
pub(crate) fn generated_id(prefix: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}{}-{}",
        prefix,
        now.timestamp_nanos_opt().unwrap_or_default(),
        seq
    )
}
