//! Token-bucket rate limiting per ordered (source domain, destination domain)
//! pair.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tgp_core::DomainId;

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    #[serde(default = "default_refill")]
    pub refill_per_sec: f64,
    /// Bucket capacity (maximum burst).
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_refill() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    50
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_per_sec: default_refill(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One bucket per ordered domain pair. Each evaluation refills and consumes
/// under the pair's map-entry lock, so concurrent callers never double-spend
/// a token.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<(DomainId, DomainId), TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn try_acquire(&self, source: &DomainId, dest: &DomainId) -> bool {
        self.try_acquire_at(source, dest, Instant::now())
    }

    pub fn try_acquire_at(&self, source: &DomainId, dest: &DomainId, now: Instant) -> bool {
        let mut bucket = self
            .buckets
            .entry((source.clone(), dest.clone()))
            .or_insert_with(|| {
                TokenBucket::new(self.config.burst as f64, self.config.refill_per_sec, now)
            });
        let allowed = bucket.try_consume(now);
        if !allowed {
            tracing::debug!(source = %source, dest = %dest, "rate limit exhausted");
        }
        allowed
    }

    /// Number of tracked domain pairs.
    pub fn tracked_pairs(&self) -> usize {
        self.buckets.len()
    }
}
