//! A recording bus for tests and local runs.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{BusError, BusMessage, MessageBus};
use crate::types::MessageId;

#[derive(Debug, Default)]
struct Recorded {
    messages: Vec<(String, BusMessage)>,
    batch_sizes: Vec<usize>,
}

/// Keeps every published message in memory.
///
/// Failures can be injected with [`InMemoryBus::fail_next`]; each injected
/// failure rejects one whole `publish_batch` call.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    recorded: Mutex<Recorded>,
    fail_remaining: AtomicU32,
    fail_permanently: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` batch calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_permanently.store(false, Ordering::SeqCst);
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` batch calls fail with a permanent error.
    pub fn reject_next(&self, count: u32) {
        self.fail_permanently.store(true, Ordering::SeqCst);
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Every delivered message in delivery order, with its topic.
    pub fn messages(&self) -> Vec<(String, BusMessage)> {
        self.lock().messages.clone()
    }

    /// The `id` attribute of every delivered message, in delivery order.
    pub fn delivered_ids(&self) -> Vec<String> {
        self.lock()
            .messages
            .iter()
            .filter_map(|(_, m)| m.attributes.get("id").cloned())
            .collect()
    }

    /// Size of each successful `publish_batch` call.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self) -> Option<BusError> {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| {
                if self.fail_permanently.load(Ordering::SeqCst) {
                    BusError::permanent("injected rejection")
                } else {
                    BusError::transient("injected failure")
                }
            })
    }
}

impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<MessageId, BusError> {
        let mut ids = self.publish_batch(topic, std::slice::from_ref(message)).await?;
        ids.pop()
            .ok_or_else(|| BusError::permanent("no message id recorded"))
    }

    async fn publish_batch(
        &self,
        topic: &str,
        messages: &[BusMessage],
    ) -> Result<Vec<MessageId>, BusError> {
        if self.is_closed() {
            return Err(BusError::permanent("bus closed"));
        }
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        let mut recorded = self.lock();
        let start = recorded.messages.len();
        recorded
            .messages
            .extend(messages.iter().map(|m| (topic.to_string(), m.clone())));
        recorded.batch_sizes.push(messages.len());

        Ok((start..start + messages.len())
            .map(|i| MessageId::new(format!("mem-{}", i + 1)))
            .collect())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
