//! Bounded exponential backoff for batch delivery.
//!
//! A failed batch is retried as a whole before the publisher moves on, so a
//! retry never reorders batches. Only transient bus errors are retried;
//! permanent errors return immediately. When retries are exhausted the batch
//! is dropped by the caller.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bus::BusError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Default for batch delivery: 2 retries with 200ms and 400ms delays.
    pub const DEFAULT: Self = Self {
        max_retries: 2,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 2.0,
    };

    /// No retries: a failed batch is dropped immediately.
    pub const NONE: Self = Self {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Same delays as `self` with a different retry count.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Delay for the given retry attempt (0-indexed):
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }

    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Runs `operation` until it succeeds, fails permanently, or retries run out.
///
/// Once `cancel` fires no further retry is started: the last error is
/// returned instead of waiting out the backoff.
///
/// Returns the last error on failure together with the number of attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, (BusError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !e.is_retriable() || attempt >= max_attempts || cancel.is_cancelled() {
                    return Err((e, attempt));
                }

                let delay = config.delay_for_attempt(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying delivery");
                tokio::select! {
                    _ = cancel.cancelled() => return Err((e, attempt)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
