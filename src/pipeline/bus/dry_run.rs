//! A bus that logs instead of delivering.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use super::{BusError, BusMessage, MessageBus};
use crate::types::MessageId;

/// Logs every message at info level and hands back synthetic IDs.
#[derive(Debug, Default)]
pub struct DryRunBus {
    next_id: AtomicU64,
}

impl DryRunBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages "published" so far.
    pub fn published(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

impl MessageBus for DryRunBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<MessageId, BusError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            topic,
            event_type = message.attributes.get("type").map(String::as_str).unwrap_or(""),
            event_id = message.attributes.get("id").map(String::as_str).unwrap_or(""),
            bytes = message.data.len(),
            "Dry run: would publish"
        );
        Ok(MessageId::new(format!("dry-run-{}", n)))
    }
}
