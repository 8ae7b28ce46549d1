//! Bounded retry with exponential backoff.
//!
//! Network operations return `Result<T, E>` where `E` says whether it is worth
//! another attempt through [`Retryable`]. [`retry_with_hook`] keeps calling the
//! operation until it succeeds, fails fatally, or runs out of attempts, waiting
//! `base_delay * 2^n` (capped at `max_delay`) between attempts. The hook fires
//! once per failed attempt, before the wait.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether the failed operation may be repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for super::Error {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// A policy that never waits. Handy for tests and interactive tools.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Runs `op` under `policy`, logging every failed attempt.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_hook(policy, op, |attempt, err: &E| {
        tracing::warn!(attempt, retryable = err.is_retryable(), "attempt failed: {err}");
    })
    .await
}

/// Runs `op` under `policy`, calling `hook(attempt, &err)` after each failure.
///
/// Non-retryable errors are returned immediately. After `max_attempts`
/// failures the last error is returned.
pub async fn retry_with_hook<T, E, F, Fut, H>(
    policy: RetryPolicy,
    mut op: F,
    mut hook: H,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    H: FnMut(u32, &E),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                hook(attempt, &err);
                if !err.is_retryable() || attempt >= max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_after(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
