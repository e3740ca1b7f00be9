//! Virtual-clock environment.
//!
//! Time only moves when a test calls [`SimEnv::advance`] or when code under
//! test sleeps: `sleep(d)` advances the clock by `d` and yields once instead
//! of waiting. A retry loop with five seconds of backoff therefore finishes
//! immediately while still observing five seconds of elapsed time.
//!
//! Clones share one clock and one seeded RNG.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use skein_core::Environment;

/// Keeps `base + offset` far from `Instant` overflow.
const MAX_OFFSET: Duration = Duration::from_secs(u32::MAX as u64);

/// Unix time the virtual clock starts at (2023-11-14T22:13:20Z).
const UNIX_EPOCH_OFFSET: i64 = 1_700_000_000;

struct Clock {
    base: Instant,
    offset: Mutex<Duration>,
    rng: Mutex<ChaCha8Rng>,
}

/// Deterministic [`Environment`] with a manually driven clock.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<Clock>,
}

impl SimEnv {
    /// Clock at zero, RNG seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Clock at zero, RNG seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            clock: Arc::new(Clock {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            }),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.clock.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset = offset.saturating_add(duration).min(MAX_OFFSET);
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        *self.clock.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("elapsed", &self.elapsed()).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        self.clock.base + self.elapsed()
    }

    fn unix_time(&self) -> i64 {
        UNIX_EPOCH_OFFSET + self.elapsed().as_secs() as i64
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            env.advance(duration);
            tokio::task::yield_now().await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.clock.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
