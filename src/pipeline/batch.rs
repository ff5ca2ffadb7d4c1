//! Batch accumulation with count, byte and linger thresholds.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::NormalizedEvent;

/// Default maximum number of events per batch.
pub const DEFAULT_MAX_EVENTS: usize = 100;

/// Default payload byte threshold per batch (1 MB).
pub const DEFAULT_MAX_BYTES: usize = 1_000_000;

/// Default maximum time a batch may wait after its first event.
pub const DEFAULT_MAX_LINGER: Duration = Duration::from_millis(100);

/// The three independent flush thresholds.
///
/// Thresholds are crossing points, not hard caps: the event that crosses the
/// byte threshold is included in the batch it flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_events: usize,
    pub max_bytes: usize,
    pub max_linger: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        BatchLimits {
            max_events: DEFAULT_MAX_EVENTS,
            max_bytes: DEFAULT_MAX_BYTES,
            max_linger: DEFAULT_MAX_LINGER,
        }
    }
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Count,
    Bytes,
    Linger,
    /// Final flush while shutting down.
    Drain,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Count => "count",
            FlushReason::Bytes => "bytes",
            FlushReason::Linger => "linger",
            FlushReason::Drain => "drain",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-flight batch owned by the publisher.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<NormalizedEvent>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Cumulative payload bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the linger threshold expires, if the batch has any events.
    pub fn deadline(&self, limits: &BatchLimits) -> Option<Instant> {
        self.opened_at.map(|opened| opened + limits.max_linger)
    }

    /// Adds an event and reports whether a count or byte threshold is now
    /// reached.
    pub fn push(&mut self, event: NormalizedEvent, limits: &BatchLimits) -> Option<FlushReason> {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += event.payload_len();
        self.events.push(event);

        if self.events.len() >= limits.max_events {
            Some(FlushReason::Count)
        } else if self.bytes >= limits.max_bytes {
            Some(FlushReason::Bytes)
        } else {
            None
        }
    }

    /// Removes and returns the accumulated events, resetting the batch.
    pub fn take(&mut self) -> Vec<NormalizedEvent> {
        self.bytes = 0;
        self.opened_at = None;
        std::mem::take(&mut self.events)
    }
}
