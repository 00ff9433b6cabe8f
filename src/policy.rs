use std::time::Duration;

use crate::error::Error;

/// A rate-limit policy attached to a route or route group.
///
/// A policy is a plain value: clone it freely, it carries no shared state.
/// The middleware copies the policy at construction time, so later mutations
/// of the original have no effect on a running limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Maximum number of allowed requests per [`window`](Self::window).
    pub limit: u32,

    /// The time period for [`limit`](Self::limit).
    pub window: Duration,

    /// Extra capacity for short spikes (token-bucket style).
    /// Set to 0 for strict limiting.
    pub burst: u32,

    /// Token cost of a single request (default 1). Use higher values for
    /// expensive endpoints.
    pub cost: u32,

    /// Human-readable name used for logging and the deny table.
    pub scope: String,

    /// Per-policy override. When false the middleware is a no-op.
    pub enabled: bool,

    /// Caps the number of in-flight requests per key. 0 means unlimited.
    pub concurrency_limit: u32,
}

impl Default for Policy {
    /// A sensible default: 300/min with burst 60.
    fn default() -> Self {
        Self {
            limit: 300,
            window: Duration::from_secs(60),
            burst: 60,
            cost: 1,
            scope: "default".to_string(),
            enabled: true,
            concurrency_limit: 0,
        }
    }
}

impl Policy {
    /// Generous limit for anonymous page browsing.
    pub fn public_browse() -> Self {
        Self {
            scope: "public_browse".to_string(),
            ..Self::default()
        }
    }

    /// Standard limit for authenticated API traffic.
    pub fn api_default() -> Self {
        Self {
            limit: 120,
            burst: 30,
            scope: "api_default".to_string(),
            ..Self::default()
        }
    }

    /// Tight limit for login and password-reset endpoints.
    pub fn auth_sensitive() -> Self {
        Self {
            limit: 10,
            burst: 0,
            scope: "auth_sensitive".to_string(),
            ..Self::default()
        }
    }

    /// Very tight limit plus a concurrency cap for heavy operations.
    pub fn exports() -> Self {
        Self {
            limit: 10,
            burst: 0,
            concurrency_limit: 1,
            scope: "exports".to_string(),
            ..Self::default()
        }
    }

    /// Total bucket capacity: `limit + burst`.
    pub fn max_tokens(&self) -> u32 {
        self.limit + self.burst
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.limit) / self.window.as_secs_f64()
    }

    /// Check that the policy can produce a working bucket.
    ///
    /// A `limit` of zero or an empty `window` would yield a refill rate of
    /// zero, so both are rejected.
    pub fn validate(&self) -> Result<(), Error> {
        if self.limit == 0 {
            return Err(Error::InvalidPolicy("limit must be at least 1".into()));
        }
        if self.window.is_zero() {
            return Err(Error::InvalidPolicy("window must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for policy in [
            Policy::default(),
            Policy::public_browse(),
            Policy::api_default(),
            Policy::auth_sensitive(),
            Policy::exports(),
        ] {
            policy.validate().unwrap();
        }
    }

    #[test]
    fn rejects_zero_limit() {
        let policy = Policy {
            limit: 0,
            ..Policy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn rejects_zero_window() {
        let policy = Policy {
            window: Duration::ZERO,
            ..Policy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn derived_values() {
        let policy = Policy {
            limit: 10,
            window: Duration::from_secs(5),
            burst: 5,
            ..Policy::default()
        };
        assert_eq!(policy.max_tokens(), 15);
        assert!((policy.refill_rate() - 2.0).abs() < f64::EPSILON);
    }
}
