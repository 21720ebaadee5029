//! Linear-backoff retry policy
//!
//! The delay before retry `n` (zero-based) is `base_delay * (n + 1)`, plus an
//! optional uniform random jitter in `[0, jitter]`. Permanent failures are
//! never retried. The sleep suspends only the retrying call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, warn};

use crate::classify::{ErrorClassification, Retryable};

/// Extra attempts after the first one.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Delay unit for linear backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    /// Policy with exact linear delays (no jitter).
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Add up to `jitter` of uniform random delay to every backoff.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Linear backoff before retry number `attempt` (zero-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }

    /// Delay before the next attempt, or `None` if the error must surface.
    pub fn next_delay<E: Retryable>(&self, attempt: u32, error: &E) -> Option<Duration> {
        if error.classification() == ErrorClassification::Permanent {
            return None;
        }
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.backoff(attempt) + self.sample_jitter())
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.run_with((), |()| {
            let attempt = op();
            async move { ((), attempt.await) }
        })
        .await
    }

    /// Like [`run`](Self::run), threading a value through every attempt.
    ///
    /// Each attempt receives the value the previous attempt handed back, so
    /// per-call state (such as which one-shot refreshes were already spent)
    /// survives transient retries.
    pub async fn run_with<S, F, Fut, T, E>(&self, mut state: S, mut op: F) -> Result<T, E>
    where
        F: FnMut(S) -> Fut,
        Fut: Future<Output = (S, Result<T, E>)>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            let (next, result) = op(state).await;
            state = next;

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(delay) = self.next_delay(attempt, &error) else {
                debug!(attempt, error = %error, "not retrying");
                return Err(error);
            };

            warn!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            metrics::counter!("api_retries_total").increment(1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
