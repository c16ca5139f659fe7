//! Token bucket rate limiting per protocol or service.
//!
//! Buckets refill lazily on each check. A check against a bucket that was
//! never configured is allowed (fail-open).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::time::Instant;

use crate::inspector::Protocol;
use crate::observability::metrics::{self as m, SharedSink};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    protocol: Protocol,
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(name: impl Into<String>, protocol: Protocol, capacity: f64, refill_rate: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            name: name.into(),
            protocol,
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take `n` tokens if available. Leaves the balance untouched on denial.
    pub fn try_acquire(&self, n: f64) -> (bool, f64) {
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            (true, state.tokens)
        } else {
            (false, state.tokens)
        }
    }

    fn same_settings(&self, protocol: Protocol, capacity: f64, refill_rate: f64) -> bool {
        self.protocol == protocol
            && self.capacity == capacity.max(0.0)
            && self.refill_rate == refill_rate.max(0.0)
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        self.refill(&mut state);
        state.tokens
    }

    pub fn stats(&self) -> BucketStats {
        let available = self.available();
        let utilization = if self.capacity > 0.0 {
            1.0 - available / self.capacity
        } else {
            0.0
        };
        BucketStats {
            name: self.name.clone(),
            protocol: self.protocol,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            available_tokens: available,
            utilization,
        }
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketStats {
    pub name: String,
    pub protocol: Protocol,
    pub capacity: f64,
    pub refill_rate: f64,
    pub available_tokens: f64,
    /// Fraction of capacity currently consumed, 0.0 to 1.0.
    pub utilization: f64,
}

/// Named token buckets.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    metrics: SharedSink,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.bucket_names())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(metrics: SharedSink) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Create a bucket, replacing any existing bucket with the same name.
    pub fn add_bucket(&self, name: &str, protocol: Protocol, capacity: f64, refill_rate: f64) {
        let bucket = Arc::new(TokenBucket::new(name, protocol, capacity, refill_rate));
        let previous = self
            .buckets
            .write()
            .expect("rate limiter lock poisoned")
            .insert(name.to_string(), bucket);

        if previous.is_some() {
            tracing::warn!(bucket = %name, "Replacing existing rate limit bucket");
        }
        tracing::info!(bucket = %name, protocol = %protocol, capacity, refill_rate, "Added rate limit bucket");
        self.metrics.set_gauge(
            m::RATELIMIT_TOKENS,
            &[("protocol", protocol.to_string()), ("bucket", name.to_string())],
            capacity.max(0.0),
        );
    }

    /// Like [`add_bucket`](Self::add_bucket), but keeps an existing bucket
    /// and its drained balance when the settings are unchanged.
    ///
    /// Returns `true` when a bucket was created or replaced.
    pub fn ensure_bucket(&self, name: &str, protocol: Protocol, capacity: f64, refill_rate: f64) -> bool {
        let unchanged = self
            .buckets
            .read()
            .expect("rate limiter lock poisoned")
            .get(name)
            .is_some_and(|b| b.same_settings(protocol, capacity, refill_rate));
        if unchanged {
            tracing::debug!(bucket = %name, "Rate limit bucket unchanged");
            return false;
        }
        self.add_bucket(name, protocol, capacity, refill_rate);
        true
    }

    pub fn remove_bucket(&self, name: &str) -> bool {
        let removed = self
            .buckets
            .write()
            .expect("rate limiter lock poisoned")
            .remove(name)
            .is_some();
        if removed {
            tracing::info!(bucket = %name, "Removed rate limit bucket");
        }
        removed
    }

    fn bucket(&self, name: &str) -> Option<Arc<TokenBucket>> {
        self.buckets
            .read()
            .expect("rate limiter lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn allow(&self, name: &str) -> bool {
        self.allow_n(name, 1)
    }

    /// Take `n` tokens from `name`. Unknown buckets always allow.
    pub fn allow_n(&self, name: &str, n: u32) -> bool {
        let Some(bucket) = self.bucket(name) else {
            return true;
        };

        let (allowed, remaining) = bucket.try_acquire(f64::from(n));
        let labels = [
            ("protocol", bucket.protocol.to_string()),
            ("bucket", name.to_string()),
        ];

        if allowed {
            self.metrics.increment_counter(m::RATELIMIT_ALLOWED, &labels);
        } else {
            tracing::warn!(bucket = %name, requested = n, available = remaining, "Rate limit exceeded");
            self.metrics.increment_counter(m::RATELIMIT_DENIED, &labels);
        }
        self.metrics.set_gauge(m::RATELIMIT_TOKENS, &labels, remaining);
        allowed
    }

    pub fn available_tokens(&self, name: &str) -> Option<f64> {
        self.bucket(name).map(|b| b.available())
    }

    pub fn bucket_stats(&self, name: &str) -> Option<BucketStats> {
        self.bucket(name).map(|b| b.stats())
    }

    /// Stats for every bucket, sorted by name.
    pub fn all_stats(&self) -> Vec<BucketStats> {
        let buckets: Vec<Arc<TokenBucket>> = self
            .buckets
            .read()
            .expect("rate limiter lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<BucketStats> = buckets.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .read()
            .expect("rate limiter lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
