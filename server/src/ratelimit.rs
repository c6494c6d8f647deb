//! Per-network token bucket

use crate::config::RateLimit;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Token bucket throttle for broadcast and bulk unicast traffic.
///
/// The bucket starts full. Tokens refill continuously at `per_second` up to
/// `burst`; a request for more tokens than the bucket can ever hold is
/// never satisfied.
#[derive(Debug)]
pub struct TokenBucket {
    per_second: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    granted: u64,
    denied: u64,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(limit: RateLimit, now: Instant) -> Self {
        let capacity = f64::from(limit.burst);
        Self {
            per_second: limit.per_second,
            capacity,
            tokens: capacity,
            last_refill: now,
            granted: 0,
            denied: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens if available right now.
    pub fn acquire(&mut self, n: u32, now: Instant) -> bool {
        self.refill(now);
        let needed = f64::from(n);
        if self.tokens >= needed {
            self.tokens -= needed;
            self.granted += u64::from(n);
            true
        } else {
            self.denied += 1;
            false
        }
    }

    /// How long until `n` tokens are available, `None` if never
    pub fn wait_time(&mut self, n: u32, now: Instant) -> Option<Duration> {
        self.refill(now);
        let needed = f64::from(n);
        if needed > self.capacity {
            return None;
        }
        let missing = needed - self.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_secs_f64(missing / self.per_second).max(Duration::from_nanos(1)))
    }

    /// Wait for `n` tokens, giving up at `deadline`.
    ///
    /// Returns false without sleeping if the tokens cannot be available by
    /// the deadline.
    pub async fn acquire_blocking(&mut self, n: u32, deadline: Instant) -> bool {
        loop {
            let now = Instant::now();
            let Some(wait) = self.wait_time(n, now) else {
                self.denied += 1;
                return false;
            };
            if wait.is_zero() {
                return self.acquire(n, now);
            }
            let ready_at = now + wait;
            if ready_at > deadline {
                self.denied += 1;
                return false;
            }
            sleep_until(ready_at).await;
        }
    }

    #[must_use]
    pub fn stats(&self) -> TokenBucketStats {
        TokenBucketStats {
            tokens_granted: self.granted,
            requests_denied: self.denied,
            available: self.tokens,
        }
    }
}

/// Counters of a token bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketStats {
    /// Total tokens handed out.
    pub tokens_granted: u64,
    /// Requests that could not be satisfied.
    pub requests_denied: u64,
    /// Tokens left at the last refill.
    pub available: f64,
}
