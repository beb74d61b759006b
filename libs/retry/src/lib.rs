//! Bounded retry primitives.
//!
//! Inline `loop { sleep }` blocks hide their timeout behaviour. A
//! [`RetryPolicy`] names it instead: how many attempts, how long between
//! them, and how much random jitter to add so that contending callers do
//! not wake in lockstep.
//!
//! # Invariants
//!
//! - An operation is attempted at most `max_attempts` times
//! - No sleep follows the final attempt
//! - Errors the caller marks as non-retryable end the loop immediately

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Outcome of a retry loop that did not produce a value.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error the caller marked as fatal.
    #[error("aborted on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Aborted { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed { delay: Duration, jitter: Duration },

    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: Duration,
    },
}

impl Backoff {
    /// Delay after the given failed attempt (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay, .. } => *delay,
            Self::Exponential { base, max, .. } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << shift).min(*max)
            }
        }
    }

    fn jitter(&self) -> Duration {
        match self {
            Self::Fixed { jitter, .. } | Self::Exponential { jitter, .. } => *jitter,
        }
    }
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(5),
                jitter: Duration::from_millis(50),
            },
        }
    }
}

impl RetryPolicy {
    /// Fixed delay with jitter; the shape used by spin locks.
    pub fn fixed(max_attempts: u32, delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed { delay, jitter },
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                base,
                max,
                jitter: Duration::ZERO,
            },
        }
    }

    /// Delay to sleep after the given failed attempt, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.base_delay(attempt);
        let jitter = self.backoff.jitter();
        if jitter.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0..=jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }

    /// Upper bound on the total time spent sleeping.
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.backoff.base_delay(attempt) + self.backoff.jitter())
            .sum()
    }

    /// Retry `op` on every error.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_if(op, |_| true).await
    }

    /// Retry `op` while `should_retry` accepts the error.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        mut op: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !should_retry(&error) => {
                    return Err(RetryError::Aborted { attempt, error });
                }
                Err(error) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(_) => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Default attempt ceiling for background writes.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
