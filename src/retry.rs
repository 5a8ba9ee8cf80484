//! Retry policy for broker calls.
//!
//! Every outbound network operation (connect, declare, publish, consume) runs
//! through a [`RetryPolicy`]: a possibly-infinite sequence of delays plus an
//! error filter deciding which failures are worth another attempt.
//!
//! # Retry Strategy
//!
//! - Only errors accepted by the filter are retried; the default filter is
//!   [`BackendError::is_retryable`](crate::BackendError::is_retryable)
//! - Delays come from [`RetryDelays`]: an explicit list, a fixed delay
//!   repeated forever, or exponential backoff with jitter
//! - When the delay sequence runs out the last error propagates
//! - A policy without delays executes the operation exactly once

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

use crate::{log_debug, log_warn, BackendError, Result};

/// Predicate deciding whether a failure should be retried.
pub type ErrorFilter = fn(&BackendError) -> bool;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Sequence of delays slept between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDelays {
    /// One retry per listed delay.
    Fixed(Vec<Duration>),
    /// The same delay, forever.
    Repeat(Duration),
    /// Exponential backoff with ±25% jitter.
    Backoff(BackoffConfig),
}

impl RetryDelays {
    /// Explicit list of delays in whole seconds.
    pub fn secs(delays: &[u64]) -> Self {
        Self::Fixed(delays.iter().copied().map(Duration::from_secs).collect())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Duration> + Send + '_> {
        // ---
        match self {
            RetryDelays::Fixed(delays) => Box::new(delays.iter().copied()),
            RetryDelays::Repeat(delay) => Box::new(std::iter::repeat(*delay)),
            RetryDelays::Backoff(cfg) => {
                let mut current = cfg.initial_delay;
                Box::new((0..cfg.max_attempts).map(move |_| {
                    let delay = apply_jitter(current);
                    let next = Duration::from_secs_f64(
                        current.as_secs_f64() * cfg.multiplier as f64,
                    );
                    current = next.min(cfg.max_delay);
                    delay
                }))
            }
        }
    }
}

/// Retry wrapper around a fallible async operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Option<RetryDelays>,
    filter: ErrorFilter,
}

impl RetryPolicy {
    /// Policy with the default network-error filter.
    pub fn new(delays: Option<RetryDelays>) -> Self {
        Self {
            delays,
            filter: BackendError::is_retryable,
        }
    }

    /// Single attempt, failures propagate immediately.
    pub fn none() -> Self {
        Self::new(None)
    }

    /// Replace the error filter.
    pub fn with_filter(mut self, filter: ErrorFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn delays(&self) -> Option<&RetryDelays> {
        self.delays.as_ref()
    }

    /// Execute `operation`, retrying filtered failures per the delay sequence.
    ///
    /// `name` only labels log lines.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let policy = RetryPolicy::new(Some(RetryDelays::secs(&[5, 5])));
    /// policy.run("send_task", || async { publish().await }).await?;
    /// ```
    pub async fn run<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        let Some(delays) = &self.delays else {
            return operation().await;
        };

        let mut delays = delays.iter();
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if (self.filter)(&err) => {
                    attempt += 1;
                    let Some(delay) = delays.next() else {
                        log_debug!("{name}: retry exhausted after {attempt} attempts: {err}");
                        return Err(err);
                    };
                    log_warn!("{name}: attempt {attempt} failed ({err}), retry in {delay:?}");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
