//! Per-address token-bucket rate limiter.
//!
//! One bucket per authenticated address, created lazily on first use and
//! dropped on disconnect. The map lives under a plain mutex; the critical
//! section is a few float ops, never I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Default sustained rate in messages per second.
pub const DEFAULT_RATE: f64 = 1.0;
/// Default burst allowance.
pub const DEFAULT_BURST: u32 = 10;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        RateLimiter {
            rate,
            burst: f64::from(burst),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if `address` may send one message now.
    ///
    /// Lazily creates a full bucket on first sight, refills by elapsed
    /// time capped at `burst`, and takes one token on success.
    pub fn allow(&self, address: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(address.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop the bucket for a disconnected address.
    pub fn remove(&self, address: &str) {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_honored_then_exhausted() {
        let limiter = RateLimiter::new(1.0, 10);
        // Burst of 10 goes through back-to-back.
        for i in 0..10 {
            assert!(limiter.allow("pinch:a@r"), "message {i} should pass");
        }
        // 11th and 12th are rejected (refill at 1/s is negligible here).
        assert!(!limiter.allow("pinch:a@r"));
        assert!(!limiter.allow("pinch:a@r"));
    }

    #[test]
    fn addresses_have_independent_buckets() {
        let limiter = RateLimiter::new(1.0, 2);
        assert!(limiter.allow("pinch:a@r"));
        assert!(limiter.allow("pinch:a@r"));
        assert!(!limiter.allow("pinch:a@r"));
        // A different sender is unaffected.
        assert!(limiter.allow("pinch:b@r"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(1000.0, 1);
        assert!(limiter.allow("pinch:a@r"));
        assert!(!limiter.allow("pinch:a@r"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        // 5 ms at 1000/s refills the single-token bucket.
        assert!(limiter.allow("pinch:a@r"));
    }

    #[test]
    fn remove_discards_state() {
        let limiter = RateLimiter::new(1.0, 1);
        assert!(limiter.allow("pinch:a@r"));
        assert!(!limiter.allow("pinch:a@r"));
        limiter.remove("pinch:a@r");
        assert_eq!(limiter.bucket_count(), 0);
        // Fresh bucket after reconnect.
        assert!(limiter.allow("pinch:a@r"));
    }
}
