use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;

use crate::error::StoreError;
use crate::metrics::STORE_FAILURES;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateConfig {
    pub max_tokens: f64,
    pub refill_per_sec: f64,
}

impl RateConfig {
    // `burst` requests, refilled completely over `window`
    pub fn per_window(burst: u32, window: Duration) -> Self {
        let max_tokens = f64::from(burst.max(1));
        Self {
            max_tokens,
            refill_per_sec: max_tokens / window.as_secs_f64().max(f64::EPSILON),
        }
    }

    pub fn full_refill(&self) -> Duration {
        Duration::from_secs_f64(self.max_tokens / self.refill_per_sec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub admitted: bool,
    pub remaining: u32,
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    fn fail_open() -> Self {
        Self {
            admitted: true,
            remaining: 0,
            retry_after_secs: None,
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, identity: &str) -> Result<RateDecision, StoreError>;

    /// Drops state for idle identities, returning how many were removed.
    async fn sweep(&self) -> usize {
        0
    }
}

/// Runs the check, admitting the request when the backing store is down.
pub async fn check_or_admit(limiter: &dyn RateLimiter, identity: &str) -> RateDecision {
    match limiter.check(identity).await {
        Ok(decision) => decision,
        Err(err) => {
            STORE_FAILURES.with_label_values(&["rate_limit"]).inc();
            tracing::warn!(error = %err, "rate limiter unavailable, admitting request");
            RateDecision::fail_open()
        }
    }
}

// Token bucket for one identity
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    pub tokens: f64,
    pub last_refill: Instant,
}

/// In-process token buckets, one per identity. Each check runs inside the
/// map's per-key entry lock.
pub struct TokenBucketLimiter {
    buckets: DashMap<String, RateBucket>,
    config: RateConfig,
}

impl TokenBucketLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> RateDecision {
        let config = self.config;
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert(RateBucket {
                tokens: config.max_tokens,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * config.refill_per_sec)
            .min(config.max_tokens);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision {
                admitted: true,
                remaining: bucket.tokens.floor() as u32,
                retry_after_secs: None,
            };
        }

        let retry_after = ((1.0 - bucket.tokens) / config.refill_per_sec).ceil() as u64;
        RateDecision {
            admitted: false,
            remaining: 0,
            retry_after_secs: Some(retry_after.max(1)),
        }
    }

    // Buckets idle for twice the full-refill time are indistinguishable from new ones
    pub fn sweep_at(&self, now: Instant) -> usize {
        let stale_after = self.config.full_refill() * 2;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= stale_after);
        before - self.buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    pub fn tokens(&self, identity: &str) -> Option<f64> {
        self.buckets.get(identity).map(|bucket| bucket.tokens)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(&self, identity: &str) -> Result<RateDecision, StoreError> {
        Ok(self.check_at(identity, Instant::now()))
    }

    async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }
}

// Background sweeper - runs every `every`
pub async fn bucket_sweeper(limiter: Arc<dyn RateLimiter>, every: Duration) {
    let mut interval = interval(every);
    tracing::info!(interval = ?every, "rate limit sweeper started");

    loop {
        interval.tick().await;
        let removed = limiter.sweep().await;
        if removed > 0 {
            tracing::debug!(removed, "swept idle rate limit buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl RateLimiter for Unreachable {
        async fn check(&self, _identity: &str) -> Result<RateDecision, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn burst_then_reject() {
        let limiter = TokenBucketLimiter::new(RateConfig {
            max_tokens: 3.0,
            refill_per_sec: 0.5,
        });
        let now = Instant::now();
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at("k", now);
            assert!(decision.admitted);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let rejected = limiter.check_at("k", now);
        assert!(!rejected.admitted);
        assert_eq!(rejected.retry_after_secs, Some(2));
    }

    #[test]
    fn tokens_stay_within_bounds() {
        let config = RateConfig {
            max_tokens: 2.0,
            refill_per_sec: 1.0,
        };
        let limiter = TokenBucketLimiter::new(config);
        let start = Instant::now();
        let offsets_ms = [0, 0, 0, 100, 5_000, 5_000, 5_001, 60_000, 60_000, 60_000];
        for offset in offsets_ms {
            limiter.check_at("k", start + Duration::from_millis(offset));
            let tokens = limiter.tokens("k").expect("tracked");
            assert!(tokens >= 0.0, "tokens went negative: {tokens}");
            assert!(tokens <= config.max_tokens, "tokens above max: {tokens}");
        }
    }

    #[test]
    fn one_per_minute_reports_retry_after() {
        let limiter = TokenBucketLimiter::new(RateConfig {
            max_tokens: 1.0,
            refill_per_sec: 1.0 / 60.0,
        });
        let now = Instant::now();
        assert!(limiter.check_at("client", now).admitted);
        let second = limiter.check_at("client", now + Duration::from_secs(1));
        assert!(!second.admitted);
        let retry = second.retry_after_secs.expect("retry hint");
        assert!((59..=60).contains(&retry), "retry after {retry}");
    }

    #[test]
    fn identities_are_independent() {
        let limiter = TokenBucketLimiter::new(RateConfig::per_window(1, Duration::from_secs(60)));
        let now = Instant::now();
        assert!(limiter.check_at("a", now).admitted);
        assert!(limiter.check_at("b", now).admitted);
        assert!(!limiter.check_at("a", now).admitted);
    }

    #[test]
    fn sweep_drops_only_idle_buckets() {
        let limiter = TokenBucketLimiter::new(RateConfig::per_window(10, Duration::from_secs(10)));
        let start = Instant::now();
        limiter.check_at("old", start);
        limiter.check_at("fresh", start + Duration::from_secs(25));
        assert_eq!(limiter.sweep_at(start + Duration::from_secs(30)), 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(limiter.tokens("fresh").is_some());
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        let decision = check_or_admit(&Unreachable, "anyone").await;
        assert!(decision.admitted);
    }
}
