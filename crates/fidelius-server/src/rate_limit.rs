//! Per-client request throttling with continuously refilling token buckets.
//!
//! Each client key (normally the source IP) owns a bucket holding up to
//! `capacity` tokens, refilled at `capacity` tokens per minute. Buckets live in
//! a sharded map and each is guarded by its own mutex, so clients never wait
//! on one another's accounting.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// A bucket left alone this long has refilled to capacity whatever its
/// starting level, so dropping it is indistinguishable from keeping it.
pub const IDLE_EVICTION_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Seconds since the Unix epoch.
    last_refill: f64,
}

impl Bucket {
    fn full(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, now: f64) {
        let elapsed = now - self.last_refill;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * capacity / 60.0).min(capacity);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket rate limiter keyed by client identifier.
pub struct RateLimiter {
    capacity: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("clients", &self.buckets.len())
            .finish()
    }
}

impl RateLimiter {
    /// Allow `per_minute` requests per minute per client, with bursts of up
    /// to `per_minute`. A limit of zero denies everything.
    pub fn new(per_minute: u32) -> Self {
        Self::with_clock(per_minute, Arc::new(SystemClock))
    }

    pub fn with_clock(per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: f64::from(per_minute),
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Spend one token for `client`. Returns false when the bucket is dry.
    pub fn try_consume(&self, client: &str) -> bool {
        let now = self.clock.now().as_secs_f64();

        let allowed = match self.buckets.get(client) {
            Some(bucket) => self.spend(&bucket, now),
            None => {
                let bucket = self
                    .buckets
                    .entry(client.to_owned())
                    .or_insert_with(|| Mutex::new(Bucket::full(self.capacity, now)))
                    .downgrade();
                self.spend(&bucket, now)
            }
        };

        if allowed {
            debug!(client, "request admitted");
        } else {
            warn!(client, "rate limit exceeded");
        }
        allowed
    }

    fn spend(&self, bucket: &Mutex<Bucket>, now: f64) -> bool {
        let mut bucket = bucket.lock();
        bucket.refill(self.capacity, now);
        bucket.try_take()
    }

    /// Drop buckets that have been idle for [`IDLE_EVICTION_AFTER`].
    /// Returns the number removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now().as_secs_f64();
        let idle_after = IDLE_EVICTION_AFTER.as_secs_f64();
        let mut evicted = 0usize;
        self.buckets.retain(|_, bucket| {
            let keep = now - bucket.get_mut().last_refill < idle_after;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[cfg(test)]
    fn tokens(&self, client: &str) -> Option<f64> {
        self.buckets.get(client).map(|b| b.lock().tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(per_minute: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
        (RateLimiter::with_clock(per_minute, clock.clone()), clock)
    }

    #[test]
    fn burst_up_to_capacity_then_deny() {
        let (rl, _clock) = limiter(10);
        for _ in 0..10 {
            assert!(rl.try_consume("1.2.3.4"));
        }
        assert!(!rl.try_consume("1.2.3.4"));
        assert!(!rl.try_consume("1.2.3.4"));
    }

    #[test]
    fn refills_one_token_per_six_seconds_at_ten_per_minute() {
        let (rl, clock) = limiter(10);
        for _ in 0..10 {
            assert!(rl.try_consume("c"));
        }
        assert!(!rl.try_consume("c"));

        clock.advance(Duration::from_secs(6));
        assert!(rl.try_consume("c"));
        assert!(!rl.try_consume("c"));
    }

    #[test]
    fn refill_is_fractional() {
        let (rl, clock) = limiter(60);
        for _ in 0..60 {
            assert!(rl.try_consume("c"));
        }
        clock.advance(Duration::from_millis(500));
        assert!(!rl.try_consume("c"));
        // The half token from before is kept and topped up.
        clock.advance(Duration::from_millis(500));
        assert!(rl.try_consume("c"));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let (rl, clock) = limiter(5);
        assert!(rl.try_consume("c"));
        clock.advance(Duration::from_secs(3600));
        assert!(rl.try_consume("c"));
        assert_eq!(rl.tokens("c"), Some(4.0));
    }

    #[test]
    fn denied_call_does_not_spend() {
        let (rl, clock) = limiter(6);
        for _ in 0..6 {
            rl.try_consume("c");
        }
        for _ in 0..3 {
            assert!(!rl.try_consume("c"));
        }
        assert_eq!(rl.tokens("c"), Some(0.0));
        clock.advance(Duration::from_secs(10));
        assert!(rl.try_consume("c"));
    }

    #[test]
    fn clients_are_independent() {
        let (rl, _clock) = limiter(2);
        assert!(rl.try_consume("a"));
        assert!(rl.try_consume("a"));
        assert!(!rl.try_consume("a"));
        assert!(rl.try_consume("b"));
        assert_eq!(rl.len(), 2);
    }

    #[test]
    fn zero_limit_denies_everything() {
        let (rl, clock) = limiter(0);
        assert!(!rl.try_consume("c"));
        clock.advance(Duration::from_secs(600));
        assert!(!rl.try_consume("c"));
    }

    #[test]
    fn evicts_only_idle_buckets() {
        let (rl, clock) = limiter(10);
        rl.try_consume("old");
        clock.advance(Duration::from_secs(30));
        rl.try_consume("recent");
        clock.advance(Duration::from_secs(30));

        assert_eq!(rl.evict_idle(), 1);
        assert_eq!(rl.len(), 1);
        assert!(rl.tokens("old").is_none());
        assert!(rl.tokens("recent").is_some());
    }

    #[test]
    fn concurrent_clients_never_overspend() {
        let (rl, _clock) = limiter(50);
        let admitted = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        if rl.try_consume("shared") {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.into_inner(), 50);
    }
}
