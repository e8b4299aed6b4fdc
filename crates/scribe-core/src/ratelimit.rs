//! Token-bucket admission control
//!
//! Two buckets per caller identity: one for submissions, one for polling.
//! Buckets live in process memory keyed by caller; with horizontally scaled
//! request handlers each instance enforces its own share. A refusal always
//! carries a suggested retry delay.

use dashmap::DashMap;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::{Error, Result};

/// Which per-caller bucket an operation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    /// POST /transcribe
    Submit,

    /// Status, result, and cancellation requests
    Poll,
}

impl BucketKind {
    /// Metrics/logging label
    pub fn label(&self) -> &'static str {
        match self {
            BucketKind::Submit => "submit",
            BucketKind::Poll => "poll",
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-caller token buckets
pub struct RateLimiter {
    buckets: DashMap<(BucketKind, String), Bucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter from configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn limits(&self, kind: BucketKind) -> (f64, f64) {
        match kind {
            BucketKind::Submit => (
                self.config.submit_burst as f64,
                self.config.submit_per_min as f64 / 60.0,
            ),
            BucketKind::Poll => (
                self.config.poll_burst as f64,
                self.config.poll_per_min as f64 / 60.0,
            ),
        }
    }

    /// Take one token, or refuse with a suggested retry delay
    pub fn try_acquire(&self, kind: BucketKind, caller: &str) -> Result<()> {
        let (capacity, refill_per_sec) = self.limits(kind);
        let now = Instant::now();

        let mut entry = self
            .buckets
            .entry((kind, caller.to_string()))
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });
        let bucket = entry.value_mut();

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / refill_per_sec).ceil().max(1.0) as u64;
            Err(Error::RateLimited { retry_after_secs })
        }
    }

    /// Number of callers currently tracked
    pub fn tracked_callers(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(submit_burst: u64, submit_per_min: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            submit_per_min,
            submit_burst,
            poll_per_min: 60,
            poll_burst: 60,
        })
    }

    #[test]
    fn test_burst_up_to_capacity_then_refusal() {
        let limiter = limiter(10, 10);

        for _ in 0..10 {
            limiter.try_acquire(BucketKind::Submit, "1.2.3.4").unwrap();
        }

        let err = limiter.try_acquire(BucketKind::Submit, "1.2.3.4").unwrap_err();
        match err {
            Error::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_callers_are_isolated() {
        let limiter = limiter(1, 10);

        limiter.try_acquire(BucketKind::Submit, "a").unwrap();
        assert!(limiter.try_acquire(BucketKind::Submit, "a").is_err());

        // A different caller still has a full bucket
        limiter.try_acquire(BucketKind::Submit, "b").unwrap();
    }

    #[test]
    fn test_buckets_are_independent_per_kind() {
        let limiter = limiter(1, 10);

        limiter.try_acquire(BucketKind::Submit, "a").unwrap();
        assert!(limiter.try_acquire(BucketKind::Submit, "a").is_err());

        // The poll bucket is untouched by submission spend
        for _ in 0..60 {
            limiter.try_acquire(BucketKind::Poll, "a").unwrap();
        }
        assert!(limiter.try_acquire(BucketKind::Poll, "a").is_err());
    }

    #[test]
    fn test_refill_restores_tokens() {
        // 6000/min = 100 tokens per second
        let limiter = limiter(5, 6000);

        for _ in 0..5 {
            limiter.try_acquire(BucketKind::Submit, "a").unwrap();
        }
        assert!(limiter.try_acquire(BucketKind::Submit, "a").is_err());

        std::thread::sleep(std::time::Duration::from_millis(50));
        limiter.try_acquire(BucketKind::Submit, "a").unwrap();
    }

    #[test]
    fn test_retry_after_reflects_refill_rate() {
        // 1 token per minute: the suggested delay is close to a full minute
        let limiter = limiter(1, 1);
        limiter.try_acquire(BucketKind::Submit, "a").unwrap();

        match limiter.try_acquire(BucketKind::Submit, "a").unwrap_err() {
            Error::RateLimited { retry_after_secs } => {
                assert!((55..=60).contains(&retry_after_secs));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
