//! Bounded exponential backoff.
//!
//! `with_retry` runs an operation up to `max_attempts` times. After a failed
//! attempt `i` (zero-based) it waits
//! `min(initial_delay * backoff_multiplier^i, max_delay)` before the next
//! one. There is no wait after a success or after the final attempt.
//!
//! Every failure is retried, including a `CircuitOpen` rejection from a
//! wrapped breaker, which therefore consumes an attempt.

use std::{future::Future, time::Duration};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{env::Environment, error::Cancelled};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wait after the first failure
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on any single wait
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Wait after failed attempt `attempt` (zero-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Run `op` under `policy`, returning the first success or the last error.
///
/// Cancellation is checked before every attempt and interrupts a backoff
/// wait; either way the result is `Cancelled` converted into `E`. An attempt
/// already in progress is not interrupted.
pub async fn with_retry<T, E, Env, F, Fut>(
    policy: &RetryPolicy,
    env: &Env,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    E: From<Cancelled>,
    Env: Environment,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt + 1 >= attempts {
            return Err(error);
        }

        let delay = policy.delay_after(attempt);
        tracing::debug!(attempt = attempt + 1, max_attempts = attempts, ?delay, "attempt failed, backing off");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Cancelled.into()),
            () = env.sleep(delay) => {},
        }
        attempt += 1;
    }
}
