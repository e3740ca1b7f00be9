//! Token-bucket rate limiting.
//!
//! A [`TokenBucket`] holds up to `burst` tokens and refills continuously at
//! `rate` tokens per second; each admitted call takes one. It starts full.
//! [`KeyedLimiter`] keeps one bucket per key (sender, peer address, user),
//! created on first use.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{env::Environment, error::Cancelled};

/// Bucket shape.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Single token bucket, shareable across tasks.
pub struct TokenBucket<E: Environment> {
    config: LimiterConfig,
    env: E,
    bucket: Mutex<Bucket>,
}

impl<E: Environment> TokenBucket<E> {
    /// Create a full bucket.
    pub fn new(config: LimiterConfig, env: E) -> Self {
        let bucket = Bucket { tokens: f64::from(config.burst), last_refill: env.now() };
        Self { config, env, bucket: Mutex::new(bucket) }
    }

    /// Active shape.
    pub fn config(&self) -> LimiterConfig {
        self.config
    }

    /// Take one token if available.
    pub fn take(&self) -> bool {
        let mut bucket = self.refilled();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refill.
    pub fn tokens(&self) -> f64 {
        self.refilled().tokens
    }

    /// Time until one token will be available; zero if one is available now.
    pub fn time_until_available(&self) -> Duration {
        let bucket = self.refilled();
        self.wait_for(bucket.tokens)
    }

    /// Wait until a token can be taken, then take it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let wait = {
                let mut bucket = self.refilled();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                self.wait_for(bucket.tokens)
            };

            if wait == Duration::MAX {
                cancel.cancelled().await;
                return Err(Cancelled);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Cancelled),
                () = self.env.sleep(wait) => {},
            }
        }
    }

    fn wait_for(&self, tokens: f64) -> Duration {
        let missing = 1.0 - tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        if self.config.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(missing / self.config.rate).unwrap_or(Duration::MAX)
    }

    fn refilled(&self) -> MutexGuard<'_, Bucket> {
        let now = self.env.now();
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        let capacity = f64::from(self.config.burst);
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate).min(capacity);
        bucket.last_refill = now;
        bucket
    }
}

impl<E: Environment> fmt::Debug for TokenBucket<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket").field("config", &self.config).finish_non_exhaustive()
    }
}

/// One lazily-created bucket per key.
pub struct KeyedLimiter<E: Environment> {
    config: LimiterConfig,
    env: E,
    buckets: Mutex<HashMap<String, Arc<TokenBucket<E>>>>,
}

impl<E: Environment> KeyedLimiter<E> {
    /// Create a limiter with no buckets yet.
    pub fn new(config: LimiterConfig, env: E) -> Self {
        Self { config, env, buckets: Mutex::new(HashMap::new()) }
    }

    /// Take one token from `key`'s bucket.
    pub fn take(&self, key: &str) -> bool {
        self.bucket(key).take()
    }

    /// Wait for a token from `key`'s bucket.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let bucket = self.bucket(key);
        bucket.acquire(cancel).await
    }

    /// Drop `key`'s bucket. The next use starts full again.
    pub fn forget(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no bucket exists yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket<E>> {
        let mut buckets = self.lock();
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(TokenBucket::new(self.config, self.env.clone()));
        buckets.insert(key.to_owned(), Arc::clone(&bucket));
        bucket
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TokenBucket<E>>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Environment> fmt::Debug for KeyedLimiter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLimiter").field("config", &self.config).field("keys", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SystemEnv;

    fn config(rate: f64, burst: u32) -> LimiterConfig {
        LimiterConfig { rate, burst }
    }

    #[test]
    fn starts_full_and_drains() {
        let bucket = TokenBucket::new(config(0.0, 3), SystemEnv);
        assert!(bucket.take());
        assert!(bucket.take());
        assert!(bucket.take());
        assert!(!bucket.take());
    }

    #[test]
    fn zero_rate_never_becomes_available() {
        let bucket = TokenBucket::new(config(0.0, 1), SystemEnv);
        assert!(bucket.take());
        assert_eq!(bucket.time_until_available(), Duration::MAX);
    }

    #[test]
    fn keyed_buckets_are_independent() {
        let limiter = KeyedLimiter::new(config(0.0, 1), SystemEnv);
        assert!(limiter.take("a"));
        assert!(!limiter.take("a"));
        assert!(limiter.take("b"));
        assert_eq!(limiter.len(), 2);

        assert!(limiter.forget("a"));
        assert!(limiter.take("a"));
    }

    #[tokio::test]
    async fn acquire_honours_cancellation() {
        let bucket = TokenBucket::new(config(0.0, 1), SystemEnv);
        let cancel = CancellationToken::new();
        assert_eq!(bucket.acquire(&cancel).await, Ok(()));

        cancel.cancel();
        assert_eq!(bucket.acquire(&cancel).await, Err(Cancelled));
    }
}
