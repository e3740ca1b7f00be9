//! Circuit breaker transitions under a virtual clock.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use skein_core::{BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState};
use skein_harness::{RecordingTelemetry, SimEnv, eventually};
use tokio::sync::oneshot;

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Open,
    Failed,
}

impl From<CircuitOpen> for Outcome {
    fn from(_: CircuitOpen) -> Self {
        Self::Open
    }
}

const RESET: Duration = Duration::from_secs(10);

fn breaker(env: &SimEnv, threshold: u32) -> (CircuitBreaker<SimEnv>, Arc<RecordingTelemetry>) {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let breaker = CircuitBreaker::new(BreakerConfig { threshold, reset_timeout: RESET }, env.clone())
        .with_telemetry(telemetry.clone());
    (breaker, telemetry)
}

async fn fail(breaker: &CircuitBreaker<SimEnv>) -> Result<(), Outcome> {
    breaker.execute(|| async { Err(Outcome::Failed) }).await
}

async fn succeed(breaker: &CircuitBreaker<SimEnv>) -> Result<(), Outcome> {
    breaker.execute(|| async { Ok(()) }).await
}

#[tokio::test]
async fn full_cycle_closed_open_half_open_closed() {
    let env = SimEnv::new();
    let (breaker, telemetry) = breaker(&env, 2);

    assert_eq!(fail(&breaker).await, Err(Outcome::Failed));
    assert_eq!(fail(&breaker).await, Err(Outcome::Failed));
    assert_eq!(breaker.state(), CircuitState::Open);

    // Timeout must be strictly exceeded.
    env.advance(RESET);
    assert_eq!(succeed(&breaker).await, Err(Outcome::Open));

    env.advance(Duration::from_millis(1));
    assert_eq!(succeed(&breaker).await, Ok(()));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);

    assert_eq!(telemetry.transitions(), vec![
        (CircuitState::Closed, CircuitState::Open),
        (CircuitState::Open, CircuitState::HalfOpen),
        (CircuitState::HalfOpen, CircuitState::Closed),
    ]);
}

#[tokio::test]
async fn failed_trial_reopens_and_restarts_timeout() {
    let env = SimEnv::new();
    let (breaker, _) = breaker(&env, 1);

    let _ = fail(&breaker).await;
    env.advance(RESET + Duration::from_secs(1));
    assert_eq!(fail(&breaker).await, Err(Outcome::Failed));
    assert_eq!(breaker.state(), CircuitState::Open);

    env.advance(Duration::from_secs(5));
    assert_eq!(succeed(&breaker).await, Err(Outcome::Open));

    env.advance(Duration::from_secs(6));
    assert_eq!(succeed(&breaker).await, Ok(()));
}

#[tokio::test]
async fn rejected_calls_never_run() {
    let env = SimEnv::new();
    let (breaker, _) = breaker(&env, 1);
    let _ = fail(&breaker).await;

    let calls = AtomicUsize::new(0);
    for _ in 0..10 {
        let r: Result<(), Outcome> = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(()) }
            })
            .await;
        assert_eq!(r, Err(Outcome::Open));
    }
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn only_one_trial_in_flight() {
    let env = SimEnv::new();
    let (breaker, _) = breaker(&env, 1);
    let breaker = Arc::new(breaker);
    let _ = fail(&breaker).await;
    env.advance(RESET * 2);

    let (release, released) = oneshot::channel::<()>();
    let trial = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    let _ = released.await;
                    Ok::<(), Outcome>(())
                })
                .await
        })
    };

    assert!(eventually(Duration::from_secs(5), || breaker.state() == CircuitState::HalfOpen).await);
    assert_eq!(succeed(&breaker).await, Err(Outcome::Open));

    release.send(()).unwrap();
    assert_eq!(trial.await.unwrap(), Ok(()));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn abandoned_trial_returns_to_open_without_restarting_timeout() {
    let env = SimEnv::new();
    let (breaker, telemetry) = breaker(&env, 1);
    let _ = fail(&breaker).await;
    env.advance(RESET * 2);

    let pending = breaker.execute(|| std::future::pending::<Result<(), Outcome>>());
    assert!(pending.now_or_never().is_none());
    assert_eq!(breaker.state(), CircuitState::Open);

    // No clock movement needed: the timeout had already elapsed.
    assert_eq!(succeed(&breaker).await, Ok(()));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(telemetry.transitions().contains(&(CircuitState::HalfOpen, CircuitState::Open)));
}

#[tokio::test]
async fn intermittent_failures_below_threshold_stay_closed() {
    let env = SimEnv::new();
    let (breaker, telemetry) = breaker(&env, 3);

    for _ in 0..20 {
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(succeed(&breaker).await, Ok(()));
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(telemetry.transitions().is_empty());
}
