//! Message bus abstraction used by the batch publisher.
//!
//! The publisher only depends on [`MessageBus`]. Implementations:
//!
//! - [`PubSubBus`]: Google Cloud Pub/Sub over its REST API
//! - [`DryRunBus`]: logs messages instead of delivering them
//! - [`InMemoryBus`]: records messages, for tests and local runs
//!
//! Bus errors are classified as transient or permanent; only transient errors
//! are retried.

mod dry_run;
mod memory;
mod pubsub;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use thiserror::Error;

use crate::types::{MessageId, NormalizedEvent};

pub use dry_run::DryRunBus;
pub use memory::InMemoryBus;
pub use pubsub::{PUBSUB_ENDPOINT, PubSubBus, PubSubConfig};

/// One message as handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// CloudEvents JSON encoding of the event.
    pub data: Vec<u8>,
    /// Routing metadata (`type`, `source`, `id` plus the event's attributes).
    pub attributes: BTreeMap<String, String>,
}

impl BusMessage {
    pub fn from_event(event: &NormalizedEvent) -> Result<Self, serde_json::Error> {
        Ok(BusMessage {
            data: event.to_cloudevent_json()?,
            attributes: event.routing_attributes(),
        })
    }
}

/// Whether a bus failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// Network failures, timeouts, throttling and 5xx responses.
    Transient,

    /// Rejections that will fail the same way again (bad request, missing
    /// topic, permission denied).
    Permanent,
}

impl BusErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, BusErrorKind::Transient)
    }
}

/// A delivery failure reported by a [`MessageBus`].
#[derive(Debug, Error)]
pub struct BusError {
    pub kind: BusErrorKind,

    /// The HTTP status code, if the bus speaks HTTP.
    pub status_code: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "bus error (HTTP {}): {}", code, self.message),
            None => write!(f, "bus error: {}", self.message),
        }
    }
}

impl BusError {
    pub fn transient(message: impl Into<String>) -> Self {
        BusError {
            kind: BusErrorKind::Transient,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        BusError {
            kind: BusErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Classifies an HTTP status returned by the bus.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 429 => BusErrorKind::Transient,
            code if (500..600).contains(&code) => BusErrorKind::Transient,
            _ => BusErrorKind::Permanent,
        };
        BusError {
            kind,
            status_code: Some(status),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// A topic-oriented message bus.
///
/// Calls are synchronous from the publisher's point of view: a returned
/// future resolves once the bus has acknowledged (or rejected) the message.
pub trait MessageBus: Send + Sync {
    /// Publishes one message and returns the bus-assigned ID.
    fn publish(
        &self,
        topic: &str,
        message: &BusMessage,
    ) -> impl Future<Output = Result<MessageId, BusError>> + Send;

    /// Publishes a batch, preserving order.
    ///
    /// The default publishes messages one at a time and stops at the first
    /// failure. Buses with a native batch call should override this.
    fn publish_batch(
        &self,
        topic: &str,
        messages: &[BusMessage],
    ) -> impl Future<Output = Result<Vec<MessageId>, BusError>> + Send {
        async move {
            let mut ids = Vec::with_capacity(messages.len());
            for message in messages {
                ids.push(self.publish(topic, message).await?);
            }
            Ok(ids)
        }
    }

    /// Releases the bus connection. Called once, after the final flush.
    fn close(&self) -> impl Future<Output = Result<(), BusError>> + Send {
        async { Ok(()) }
    }
}
