//! Per-identity token buckets gating admission.
//!
//! Buckets refill lazily from elapsed time on every check; nothing ticks in
//! the background. Idle buckets are evicted opportunistically from the same
//! call path once the idle TTL has passed since the last sweep.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Token bucket parameters, shared by every identity.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket holds. Also the burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Buckets untouched for this long are dropped.
    pub idle_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 1.0,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

/// One identity's bucket. `tokens` stays within `[0, capacity]`.
#[derive(Debug, Clone)]
pub struct RateBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill_at: Instant,
}

impl RateBucket {
    /// A fresh bucket starts full.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // Instants before the last refill add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).clamp(0.0, self.capacity);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }

    /// Refill, then take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

struct Buckets {
    by_identity: HashMap<String, RateBucket>,
    last_sweep: Instant,
}

/// Per-identity token bucket limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets {
                by_identity: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Check-and-decrement for `identity`. Never blocks on time.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    /// [`allow`](Self::allow) against an explicit clock reading.
    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        let mut buckets = self.lock();

        if now.saturating_duration_since(buckets.last_sweep) >= self.config.idle_ttl {
            Self::sweep(&mut buckets, self.config.idle_ttl, now);
        }

        let bucket = buckets
            .by_identity
            .entry(identity.to_string())
            .or_insert_with(|| {
                RateBucket::new(self.config.capacity, self.config.refill_per_sec, now)
            });
        bucket.try_take(now)
    }

    /// Drop buckets idle for longer than the TTL. Returns how many went.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut buckets = self.lock();
        Self::sweep(&mut buckets, self.config.idle_ttl, now)
    }

    /// Number of identities with a live bucket.
    pub fn active_identities(&self) -> usize {
        self.lock().by_identity.len()
    }

    /// Current token count for `identity`, without refilling.
    pub fn tokens(&self, identity: &str) -> Option<f64> {
        self.lock().by_identity.get(identity).map(RateBucket::tokens)
    }

    fn sweep(buckets: &mut Buckets, ttl: Duration, now: Instant) -> usize {
        let before = buckets.by_identity.len();
        buckets
            .by_identity
            .retain(|_, b| now.saturating_duration_since(b.last_refill_at) < ttl);
        buckets.last_sweep = now;
        let evicted = before - buckets.by_identity.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle rate buckets");
        }
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, refill: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_per_sec: refill,
            idle_ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn burst_over_capacity_is_rejected() {
        let limiter = limiter(3.0, 1.0);
        let t0 = Instant::now();
        let results: Vec<bool> = (0..4).map(|_| limiter.allow_at("x", t0)).collect();
        assert_eq!(results, vec![true, true, true, false]);
    }

    #[test]
    fn five_messages_in_one_second_admit_three() {
        let limiter = limiter(3.0, 1.0);
        let t0 = Instant::now();
        let admitted = (0..5)
            .map(|i| limiter.allow_at("x", t0 + Duration::from_millis(i * 100)))
            .filter(|ok| *ok)
            .count();
        // 400ms of refill is less than one token.
        assert_eq!(admitted, 3);
    }

    #[test]
    fn refill_restores_tokens_over_time() {
        let limiter = limiter(2.0, 1.0);
        let t0 = Instant::now();
        assert!(limiter.allow_at("x", t0));
        assert!(limiter.allow_at("x", t0));
        assert!(!limiter.allow_at("x", t0));
        assert!(limiter.allow_at("x", t0 + Duration::from_secs(1)));
        assert!(!limiter.allow_at("x", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let limiter = limiter(3.0, 10.0);
        let t0 = Instant::now();
        assert!(limiter.allow_at("x", t0));
        assert!(limiter.allow_at("x", t0 + Duration::from_secs(30)));
        let tokens = limiter.tokens("x").unwrap();
        assert!((0.0..=3.0).contains(&tokens), "tokens = {tokens}");
        assert_eq!(tokens, 2.0);
    }

    #[test]
    fn tokens_never_go_negative() {
        let limiter = limiter(1.0, 0.0);
        let t0 = Instant::now();
        for _ in 0..10 {
            limiter.allow_at("x", t0);
        }
        assert_eq!(limiter.tokens("x"), Some(0.0));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = limiter(1.0, 0.0);
        let t0 = Instant::now();
        assert!(limiter.allow_at("alice", t0));
        assert!(!limiter.allow_at("alice", t0));
        assert!(limiter.allow_at("bob", t0));
        assert_eq!(limiter.active_identities(), 2);
    }

    #[test]
    fn idle_buckets_are_evicted_and_start_full() {
        let limiter = limiter(1.0, 0.0);
        let t0 = Instant::now();
        assert!(limiter.allow_at("x", t0));
        assert!(!limiter.allow_at("x", t0));

        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(61)), 1);
        assert_eq!(limiter.active_identities(), 0);
        assert!(limiter.allow_at("x", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn stale_clock_reading_does_not_refill() {
        let mut bucket = RateBucket::new(1.0, 1.0, Instant::now() + Duration::from_secs(5));
        assert!(bucket.try_take(Instant::now()));
        assert!(!bucket.try_take(Instant::now()));
    }
}
