use std::time::Instant;

use chrono::Utc;

use crate::policy::Policy;

/// Token-bucket state for a single key.
///
/// Refill-then-consume: every admission attempt first credits tokens for the
/// time elapsed since `last_refill`, capped at `max_tokens`, then tries to
/// take `cost` tokens. All arithmetic is done in `f64`; integer rounding
/// happens only at the result boundary.
#[derive(Debug, Clone)]
pub struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Create a bucket from a policy. Buckets start full so a fresh key can
    /// absorb up to `limit + burst` requests immediately.
    pub fn new(policy: &Policy) -> Self {
        let max = f64::from(policy.max_tokens());
        Self {
            tokens: max,
            max_tokens: max,
            refill_rate: policy.refill_rate(),
            last_refill: Instant::now(),
        }
    }

    /// Credit tokens for elapsed time. A `now` at or before `last_refill` is
    /// a no-op, so time moving backwards cannot drain the bucket.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Try to consume `cost` tokens at `now`. Returns the remaining whole
    /// tokens and whether the request is allowed. Remaining is 0 on denial.
    pub fn allow(&mut self, cost: u32, now: Instant) -> (u32, bool) {
        self.refill(now);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            (self.tokens.floor() as u32, true)
        } else {
            (0, false)
        }
    }

    /// Seconds until `cost` tokens will be available, rounded up.
    /// Zero when the bucket already holds enough.
    pub fn retry_after(&self, cost: u32) -> u64 {
        let deficit = f64::from(cost) - self.tokens;
        if deficit <= 0.0 || self.refill_rate <= 0.0 {
            return 0;
        }
        (deficit / self.refill_rate).ceil() as u64
    }

    /// Unix timestamp at which the bucket will be full again.
    pub fn reset_unix(&self) -> i64 {
        let deficit = self.max_tokens - self.tokens;
        let now = Utc::now();
        if deficit <= 0.0 || self.refill_rate <= 0.0 {
            return now.timestamp();
        }
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        (now_secs + deficit / self.refill_rate).floor() as i64
    }
}

/// The outcome of an admission check, surfaced to the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Total bucket capacity (`limit + burst`), reported in `X-RateLimit-Limit`.
    pub limit: u32,
    /// Whole tokens left after the decision.
    pub remaining: u32,
    /// Seconds to wait before retrying; zero when allowed, at least 1 on denial.
    pub retry_after: u64,
    /// Unix timestamp when the bucket would be full again.
    pub reset_at: i64,
}
