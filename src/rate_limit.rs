//! Token-bucket admission filter with probabilistic sampling of overflow.
//!
//! Bucket capacity and refill rate both equal the configured events per
//! second. When the bucket is empty, an event is still admitted with
//! probability `sampling_ratio` and counted as sampled; otherwise it is
//! dropped and counted as dropped. Counters are read and zeroed together by
//! [`RateLimiter::take_stats`].

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Callback receiving `(dropped, sampled)` counts since the last report.
pub type RateLimitHandler = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was available
    Allowed,
    /// Over the limit but admitted by sampling
    Sampled,
    /// Over the limit and rejected
    Dropped,
}

impl Decision {
    /// Whether the event should be processed.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Decision::Dropped)
    }

    /// Whether the event was admitted only because of sampling.
    pub fn is_sampled(self) -> bool {
        matches!(self, Decision::Sampled)
    }
}

/// Counters accumulated since the last call to [`RateLimiter::take_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub dropped: u64,
    pub sampled: u64,
}

struct Bucket {
    capacity: f64,
    sampling_ratio: f64,
    tokens: f64,
    last_refill: Instant,
    dropped: u64,
    sampled: u64,
    rng: StdRng,
}

/// Thread-safe token-bucket limiter. Disabled limiters admit everything.
pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_per_second` events per second.
    ///
    /// `max_per_second == 0` disables limiting. `sampling_ratio` is clamped to
    /// `[0, 1]`; NaN is treated as 0.
    pub fn new(max_per_second: u32, sampling_ratio: f64) -> Self {
        Self::starting_at(max_per_second, sampling_ratio, Instant::now())
    }

    /// A limiter that admits every event.
    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    pub(crate) fn starting_at(max_per_second: u32, sampling_ratio: f64, start: Instant) -> Self {
        if max_per_second == 0 {
            return Self::disabled();
        }

        let sampling_ratio = if sampling_ratio.is_nan() {
            0.0
        } else {
            sampling_ratio.clamp(0.0, 1.0)
        };
        let capacity = f64::from(max_per_second);

        Self {
            bucket: Some(Mutex::new(Bucket {
                capacity,
                sampling_ratio,
                tokens: capacity,
                last_refill: start,
                dropped: 0,
                sampled: 0,
                // Seeded per instance so concurrently built limiters don't
                // share a sampling sequence.
                rng: StdRng::from_entropy(),
            })),
        }
    }

    /// Whether limiting is active.
    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Check whether one event may pass now.
    pub fn allow(&self) -> Decision {
        self.allow_at(Instant::now())
    }

    pub(crate) fn allow_at(&self, now: Instant) -> Decision {
        let Some(bucket) = &self.bucket else {
            return Decision::Allowed;
        };
        let mut bucket = bucket.lock();

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.capacity).min(bucket.capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Decision::Allowed;
        }

        let ratio = bucket.sampling_ratio;
        if ratio > 0.0 && bucket.rng.gen::<f64>() < ratio {
            bucket.sampled += 1;
            return Decision::Sampled;
        }

        bucket.dropped += 1;
        Decision::Dropped
    }

    /// Read and zero the dropped/sampled counters atomically.
    pub fn take_stats(&self) -> RateLimitStats {
        let Some(bucket) = &self.bucket else {
            return RateLimitStats::default();
        };
        let mut bucket = bucket.lock();

        RateLimitStats {
            dropped: std::mem::take(&mut bucket.dropped),
            sampled: std::mem::take(&mut bucket.sampled),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.bucket {
            Some(bucket) => {
                let bucket = bucket.lock();
                f.debug_struct("RateLimiter")
                    .field("capacity", &bucket.capacity)
                    .field("sampling_ratio", &bucket.sampling_ratio)
                    .field("tokens", &bucket.tokens)
                    .finish()
            }
            None => f.write_str("RateLimiter(disabled)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::new(0, 0.5);
        assert!(!limiter.is_enabled());

        for _ in 0..10_000 {
            let decision = limiter.allow();
            assert!(decision.is_allowed());
            assert!(!decision.is_sampled());
        }
        assert_eq!(limiter.take_stats(), RateLimitStats::default());
    }

    #[test]
    fn test_bucket_starts_full() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(5, 0.0, start);

        for _ in 0..5 {
            assert_eq!(limiter.allow_at(start), Decision::Allowed);
        }
        assert_eq!(limiter.allow_at(start), Decision::Dropped);
    }

    #[test]
    fn test_refill_after_one_second() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(10, 0.0, start);

        for _ in 0..10 {
            assert_eq!(limiter.allow_at(start), Decision::Allowed);
        }
        assert_eq!(limiter.allow_at(start), Decision::Dropped);

        let later = start + Duration::from_secs(1);
        for _ in 0..10 {
            assert_eq!(limiter.allow_at(later), Decision::Allowed);
        }
        assert_eq!(limiter.allow_at(later), Decision::Dropped);
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(3, 0.0, start);

        let much_later = start + Duration::from_secs(60);
        for _ in 0..3 {
            assert_eq!(limiter.allow_at(much_later), Decision::Allowed);
        }
        assert_eq!(limiter.allow_at(much_later), Decision::Dropped);
    }

    #[test]
    fn test_partial_refill() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(10, 0.0, start);
        for _ in 0..10 {
            limiter.allow_at(start);
        }

        // 10 tokens/s for 250ms refills 2.5 tokens.
        let later = start + Duration::from_millis(250);
        assert_eq!(limiter.allow_at(later), Decision::Allowed);
        assert_eq!(limiter.allow_at(later), Decision::Allowed);
        assert_eq!(limiter.allow_at(later), Decision::Dropped);
    }

    #[test]
    fn test_full_sampling_admits_overflow() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(1, 1.0, start);

        assert_eq!(limiter.allow_at(start), Decision::Allowed);
        for _ in 0..5 {
            let decision = limiter.allow_at(start);
            assert!(decision.is_allowed());
            assert!(decision.is_sampled());
        }

        assert_eq!(
            limiter.take_stats(),
            RateLimitStats {
                dropped: 0,
                sampled: 5
            }
        );
    }

    #[test]
    fn test_stats_reset_after_take() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(1, 0.0, start);
        limiter.allow_at(start);
        limiter.allow_at(start);
        limiter.allow_at(start);

        assert_eq!(limiter.take_stats().dropped, 2);
        assert_eq!(limiter.take_stats(), RateLimitStats::default());
    }

    #[test]
    fn test_sampling_ratio_clamped() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(1, 7.5, start);
        limiter.allow_at(start);
        assert!(limiter.allow_at(start).is_sampled());

        let limiter = RateLimiter::starting_at(1, f64::NAN, start);
        limiter.allow_at(start);
        assert_eq!(limiter.allow_at(start), Decision::Dropped);
    }

    #[test]
    fn test_partial_sampling_splits_overflow() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(1, 0.5, start);
        limiter.allow_at(start);

        for _ in 0..1000 {
            limiter.allow_at(start);
        }
        let stats = limiter.take_stats();
        assert_eq!(stats.dropped + stats.sampled, 1000);
        assert!(stats.sampled > 0);
        assert!(stats.dropped > 0);
    }

    #[test]
    fn test_concurrent_allow_and_take_stats() {
        let limiter = Arc::new(RateLimiter::new(1, 0.0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(thread::spawn(move || {
                let mut allowed = 0u64;
                for _ in 0..500 {
                    if limiter.allow().is_allowed() {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut dropped = 0;
        for _ in 0..10 {
            dropped += limiter.take_stats().dropped;
        }
        let allowed: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        dropped += limiter.take_stats().dropped;

        assert_eq!(allowed + dropped, 2000);
    }
}
