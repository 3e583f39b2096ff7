//! Per-category token-bucket admission control for REST requests.
//!
//! OKX enforces distinct limits per endpoint family, so each category gets
//! its own bucket behind its own lock: waiting for a trade token must never
//! block market-data callers. Buckets refill lazily from elapsed time on
//! each acquire, no background timer.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::trace;

/// Maximum single sleep while waiting for tokens.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(500);

/// Endpoint category, resolved from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointCategory {
    Account,
    Trade,
    Market,
    Public,
    Default,
}

impl EndpointCategory {
    /// Resolve the category from an API path.
    pub fn from_path(path: &str) -> Self {
        if path.contains("/account/") {
            Self::Account
        } else if path.contains("/trade/") {
            Self::Trade
        } else if path.contains("/market/") {
            Self::Market
        } else if path.contains("/public/") {
            Self::Public
        } else {
            Self::Default
        }
    }

    /// Sustained rate (tokens/second) and burst capacity for this category.
    fn limits(&self) -> (f64, f64) {
        match self {
            Self::Account | Self::Trade => (3.0, 6.0),
            Self::Market | Self::Public => (10.0, 20.0),
            Self::Default => (5.0, 10.0),
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Account => 0,
            Self::Trade => 1,
            Self::Market => 2,
            Self::Public => 3,
            Self::Default => 4,
        }
    }
}

/// One token bucket. Mutated only under its own lock.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    capacity: f64,
}

impl Bucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            rate,
            capacity,
        }
    }

    /// Refill from elapsed time, then either debit `cost` or return how
    /// long to wait before the next attempt.
    fn try_debit(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }
}

/// Token-bucket rate limiter with one independent bucket per category.
pub struct RateLimiter {
    buckets: [Mutex<Bucket>; 5],
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        let bucket = |cat: EndpointCategory| {
            let (rate, capacity) = cat.limits();
            Mutex::new(Bucket::new(rate, capacity))
        };
        Self {
            buckets: [
                bucket(EndpointCategory::Account),
                bucket(EndpointCategory::Trade),
                bucket(EndpointCategory::Market),
                bucket(EndpointCategory::Public),
                bucket(EndpointCategory::Default),
            ],
        }
    }

    /// Acquire `cost` tokens for the category owning `path`, waiting as
    /// long as necessary. Waits are sliced so a caller re-checks at least
    /// every 500ms and never sleeps holding the bucket lock.
    pub async fn acquire(&self, path: &str, cost: u32) {
        let category = EndpointCategory::from_path(path);
        let cost = f64::from(cost);

        loop {
            let wait = {
                let mut bucket = self.buckets[category.index()].lock();
                match bucket.try_debit(cost, Instant::now()) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };

            match wait {
                None => return,
                Some(wait) => {
                    trace!(?category, wait_ms = wait.as_millis() as u64, "rate limited");
                    sleep(wait.min(MAX_WAIT_SLICE)).await;
                }
            }
        }
    }

    /// Tokens currently available for a category (test/diagnostic hook).
    pub fn available(&self, category: EndpointCategory) -> f64 {
        let mut bucket = self.buckets[category.index()].lock();
        // Refill without debiting
        let _ = bucket.try_debit(0.0, Instant::now());
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_path() {
        assert_eq!(
            EndpointCategory::from_path("/api/v5/account/balance"),
            EndpointCategory::Account
        );
        assert_eq!(
            EndpointCategory::from_path("/api/v5/trade/order"),
            EndpointCategory::Trade
        );
        assert_eq!(
            EndpointCategory::from_path("/api/v5/market/history-candles"),
            EndpointCategory::Market
        );
        assert_eq!(
            EndpointCategory::from_path("/api/v5/public/instruments"),
            EndpointCategory::Public
        );
        assert_eq!(
            EndpointCategory::from_path("/api/v5/users/self"),
            EndpointCategory::Default
        );
    }

    #[test]
    fn test_bucket_burst_then_deficit() {
        let mut bucket = Bucket::new(3.0, 6.0);
        let now = Instant::now();

        // Burst capacity admits 6 immediately.
        for _ in 0..6 {
            assert!(bucket.try_debit(1.0, now).is_ok());
        }
        // The 7th must wait ~1/3s for one token at 3/s.
        let wait = bucket.try_debit(1.0, now).unwrap_err();
        assert!(wait > Duration::from_millis(300) && wait < Duration::from_millis(400));
    }

    #[test]
    fn test_bucket_refill_capped_at_capacity() {
        let mut bucket = Bucket::new(10.0, 20.0);
        let start = Instant::now();
        assert!(bucket.try_debit(20.0, start).is_ok());

        // After a long idle period the bucket holds capacity, not more.
        let later = start + Duration::from_secs(3600);
        assert!(bucket.try_debit(20.0, later).is_ok());
        assert!(bucket.try_debit(1.0, later).is_err());
    }

    #[tokio::test]
    async fn test_acquire_independent_categories() {
        let limiter = RateLimiter::new();

        // Drain the trade bucket completely.
        for _ in 0..6 {
            limiter.acquire("/api/v5/trade/order", 1).await;
        }
        // Market category still has its full burst available.
        assert!(limiter.available(EndpointCategory::Market) > 19.0);
    }
}
