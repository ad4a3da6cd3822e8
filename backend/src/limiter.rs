//! Per-device token buckets.
//!
//! The bucket map is only write-locked when a device is seen for the first
//! time; every other request takes the read lock plus the device's own mutex.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: u32, refill_interval: Duration, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let gained = elapsed.as_secs_f64() / refill_interval.as_secs_f64();
        self.tokens = (self.tokens + gained).min(capacity as f64);
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration, // time to regain one token
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_interval: refill_interval.max(Duration::from_millis(1)),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Takes one token for `key`. On refusal returns how long until a token is available.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let bucket = self.bucket(key, now);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);

        bucket.refill(self.capacity, self.refill_interval, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(self.refill_interval.mul_f64(missing))
        }
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return bucket.clone();
        }

        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(self.capacity, now))))
            .clone()
    }

    /// Drops buckets that have refilled completely; they are indistinguishable from new ones.
    pub fn prune(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            bucket.refill(self.capacity, self.refill_interval, now);
            bucket.tokens < self.capacity as f64
        });
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whole seconds for a `Retry-After` header, never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
