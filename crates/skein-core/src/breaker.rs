//! Circuit breaker.
//!
//! Stops calling a failing dependency until it has had time to recover.
//!
//! # State Machine
//!
//! ```text
//!            failures ≥ threshold
//! ┌────────┐ ─────────────────────> ┌──────┐
//! │ Closed │                        │ Open │ <──┐
//! └────────┘ <───┐                  └──────┘    │ trial failed
//!                │ trial succeeded     │        │ (or abandoned)
//!                │                     │ reset_timeout elapsed
//!                │                  ┌──────────┐│
//!                └──────────────────│ HalfOpen │┘
//!                                   └──────────┘
//! ```
//!
//! In `HalfOpen` exactly one call (the trial) is let through; everyone else is
//! rejected until it finishes. A trial whose future is dropped before
//! completing puts the breaker back to `Open` without restarting the timeout,
//! so the next caller tries again.
//!
//! The state lives under one mutex. It is held only for the check and the
//! transition, never while the protected operation runs.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Deserialize;

use crate::{
    env::Environment,
    error::CircuitOpen,
    telemetry::{NoopTelemetry, Telemetry, TelemetryEvent},
};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub threshold: u32,
    /// How long the circuit stays open before a trial is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { threshold: 5, reset_timeout: Duration::from_secs(10) }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// One trial call is deciding whether to close again
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Failure gate around a fallible async operation.
pub struct CircuitBreaker<E: Environment> {
    config: BreakerConfig,
    env: E,
    inner: Mutex<Inner>,
    telemetry: Arc<dyn Telemetry>,
}

impl<E: Environment> CircuitBreaker<E> {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig, env: E) -> Self {
        Self {
            config,
            env,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Report transitions to `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Active thresholds.
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Current state.
    ///
    /// An open breaker whose timeout has elapsed still reports `Open` until a
    /// caller is let through as the trial.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Run `op` if the breaker admits it and record the outcome.
    ///
    /// Returns `CircuitOpen` (converted into `Er`) without invoking `op` when
    /// the circuit is open or a trial is already in flight. Any `Err` from
    /// `op` counts as a failure.
    pub async fn execute<T, Er, F, Fut>(&self, op: F) -> Result<T, Er>
    where
        Er: From<CircuitOpen>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Er>>,
    {
        let permit = self.admit()?;
        let result = op().await;
        permit.finish(result.is_ok());
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Result<Permit<'_, E>, CircuitOpen> {
        let now = self.env.now();
        let (trial, transition) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => (false, None),
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure
                        .is_none_or(|at| now.saturating_duration_since(at) > self.config.reset_timeout);
                    if !elapsed {
                        return Err(CircuitOpen);
                    }
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    (true, Some((CircuitState::Open, CircuitState::HalfOpen)))
                },
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        return Err(CircuitOpen);
                    }
                    inner.trial_in_flight = true;
                    (true, None)
                },
            }
        };

        self.announce(transition);
        Ok(Permit { breaker: self, trial, finished: false })
    }

    fn record(&self, trial: bool, success: bool) {
        let now = self.env.now();
        let transition: Transition = {
            let mut inner = self.lock();
            if success {
                if trial {
                    inner.trial_in_flight = false;
                    inner.consecutive_failures = 0;
                    inner.state = CircuitState::Closed;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    if inner.state == CircuitState::Closed {
                        inner.consecutive_failures = 0;
                    }
                    None
                }
            } else {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.last_failure = Some(now);
                if trial {
                    inner.trial_in_flight = false;
                    inner.state = CircuitState::Open;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                } else if inner.state == CircuitState::Closed
                    && inner.consecutive_failures >= self.config.threshold
                {
                    inner.state = CircuitState::Open;
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
        };

        self.announce(transition);
    }

    fn abandon_trial(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
                Some((CircuitState::HalfOpen, CircuitState::Open))
            } else {
                None
            }
        };

        self.announce(transition);
    }

    fn announce(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                tracing::warn!(%from, %to, threshold = self.config.threshold, "circuit breaker opened");
            },
            CircuitState::HalfOpen | CircuitState::Closed => {
                tracing::info!(%from, %to, "circuit breaker transition");
            },
        }
        self.telemetry.record(&TelemetryEvent::BreakerTransition { from, to });
    }
}

impl<E: Environment> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish_non_exhaustive()
    }
}

/// Admission ticket for one call. Records the outcome exactly once.
struct Permit<'a, E: Environment> {
    breaker: &'a CircuitBreaker<E>,
    trial: bool,
    finished: bool,
}

impl<E: Environment> Permit<'_, E> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker.record(self.trial, success);
    }
}

impl<E: Environment> Drop for Permit<'_, E> {
    fn drop(&mut self) {
        if !self.finished && self.trial {
            self.breaker.abandon_trial();
        }
    }
}
