pub mod mem_store;
#[cfg(feature = "redis-store")]
pub mod redis_store;

use std::sync::Arc;

use crate::bucket::Decision;
use crate::error::Error;
use crate::policy::Policy;

pub use mem_store::{MemConcurrencyStore, MemStore};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisConcurrencyStore, RedisStore};

/// Persistence backend for rate-limit buckets, keyed by string.
///
/// Implementations must make [`allow`](Store::allow) atomic per key: two
/// concurrent callers for the same key must observe a serial order, so a
/// bucket can never over-admit. Different keys may proceed in parallel.
///
/// `allow` is infallible at the call site: backends that can fail (network
/// stores) fail open internally, returning a synthetic allowed decision and
/// logging the outage.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Refill-and-consume for `key` under `policy`, charging `cost` tokens.
    async fn allow(&self, key: &str, policy: &Policy, cost: u32) -> Decision;

    /// Delete bucket state for `key`, e.g. after a successful login so a
    /// legitimate user is not punished for earlier denied attempts.
    /// Idempotent.
    async fn reset(&self, key: &str) -> Result<(), Error>;

    /// Release backing resources. Idempotent.
    async fn close(&self);
}

/// Tracks and caps in-flight requests per key.
///
/// Backends that can fail treat acquire errors as fail-open (the request is
/// admitted) and log release errors themselves, since release runs on a
/// cleanup path with nobody left to report to.
#[async_trait::async_trait]
pub trait ConcurrencyStore: Send + Sync {
    /// Increment the in-flight counter for `key` unless it is already at
    /// `limit`. Returns whether a slot was taken.
    async fn acquire(&self, key: &str, limit: u32) -> bool;

    /// Decrement the in-flight counter. Decrementing below zero is a no-op.
    async fn release(&self, key: &str);
}

#[async_trait::async_trait]
impl<T: Store + ?Sized> Store for Arc<T> {
    async fn allow(&self, key: &str, policy: &Policy, cost: u32) -> Decision {
        self.as_ref().allow(key, policy, cost).await
    }

    async fn reset(&self, key: &str) -> Result<(), Error> {
        self.as_ref().reset(key).await
    }

    async fn close(&self) {
        self.as_ref().close().await
    }
}

#[async_trait::async_trait]
impl<T: ConcurrencyStore + ?Sized> ConcurrencyStore for Arc<T> {
    async fn acquire(&self, key: &str, limit: u32) -> bool {
        self.as_ref().acquire(key, limit).await
    }

    async fn release(&self, key: &str) {
        self.as_ref().release(key).await
    }
}
