//! Environment abstraction.
//!
//! Components that need time, delays or randomness take an [`Environment`]
//! instead of calling the system directly. Production uses [`SystemEnv`];
//! tests use a virtual clock so backoff and refill behaviour can be checked
//! without real waiting.

use std::{
    future::Future,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rand::RngCore;

/// Source of time, delays and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic time, used for timeouts, refill and buffer ageing.
    fn now(&self) -> Instant;

    /// Wall-clock time in unix seconds, used for frame timestamps.
    fn unix_time(&self) -> i64;

    /// Suspend the calling task for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);
}

/// Real clock, tokio timers and the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill_bytes(buffer);
    }
}
