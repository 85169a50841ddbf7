// Retry policy and a generic helper for retrying fallible async operations


use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the remote side, e.g. a `Retry-After` header
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with optional full jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix
    Permanent(E),
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    #[inline]
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(error) | Self::Exhausted { last: error, .. } => error,
        }
    }
}

impl RetryPolicy {
    /// A policy without waiting between attempts
    #[inline]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Upper bound of the wait after failed attempt number `attempt` (1-based)
    #[inline]
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = (self.base_delay_ms as f64) * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        // capped is bounded by max_delay_ms, so the cast cannot overflow
        Duration::from_millis(capped as u64)
    }

    /// Actual wait after failed attempt `attempt`; full jitter picks uniformly in `[0, ceiling]`
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy runs out of attempts.
///
/// The closure receives the 1-based attempt number.
#[inline]
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!("{} attempt {}/{}", description, attempt, max_attempts);

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", description, attempt);
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                warn!("{} failed with non-retryable error: {}", description, error);
                return Err(RetryError::Permanent(error));
            }
            Err(error) if attempt >= max_attempts => {
                warn!(
                    "{} failed after {} attempts: {}",
                    description, attempt, error
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            Err(error) => {
                let mut delay = policy.delay_for(attempt);
                if let Some(requested) = error.retry_after() {
                    delay = delay.max(requested);
                }
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    description, attempt, max_attempts, error, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
