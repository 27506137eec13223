//! Bounded exponential backoff
//!
//! Every retried operation in the builder (object-store I/O, registry
//! lookups, status delivery, record writes) goes through [`Backoff::run`], so
//! the retry budget and the delay curve are the same everywhere.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::deadline::Deadline;

/// Errors that can tell whether trying again might help
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Outcome of a retried operation along with the attempts it took
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub attempts: u32,
    pub result: Result<T, E>,
}

impl<T, E> Attempted<T, E> {
    pub fn once(result: Result<T, E>) -> Self {
        Self {
            attempts: 1,
            result,
        }
    }

    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> Attempted<T, F> {
        Attempted {
            attempts: self.attempts,
            result: self.result.map_err(f),
        }
    }
}

/// Retry policy: doubling delay with a cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the attempt
    /// budget, or the next delay would overrun `deadline`
    pub async fn run<T, E, F, Fut>(
        &self,
        deadline: &Deadline,
        label: &str,
        mut op: F,
    ) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match op().await {
                Ok(value) => {
                    return Attempted {
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(e) => e,
            };

            let delay = self.delay_for(attempt);
            if !err.is_transient() || attempt >= self.max_attempts || deadline.remaining() <= delay
            {
                return Attempted {
                    attempts: attempt,
                    result: Err(err),
                };
            }

            warn!(
                "{} failed (attempt {}/{}): {}; retrying in {:?}",
                label, attempt, self.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
