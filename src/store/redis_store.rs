//! Redis-backed store for multi-instance deployments.
//!
//! Each key is a Redis hash with fields `tokens` and `last_ms`. The whole
//! refill-then-consume step runs as one Lua script invocation, so concurrent
//! callers across processes observe a linearizable order and can never
//! over-admit. Keys expire after two windows without traffic.
//!
//! Any transport or script error fails open: the request is admitted with a
//! full-bucket decision and the outage is logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use tracing::warn;

use crate::bucket::Decision;
use crate::config::RateLimitConfig;
use crate::error::Error;
use crate::policy::Policy;
use crate::store::{ConcurrencyStore, Store};

/// Atomic token bucket:
///  1. refill tokens for the elapsed time
///  2. try to consume `cost` tokens
///  3. persist and bump the TTL
///
/// KEYS[1] = bucket key
/// ARGV[1] = max_tokens   ARGV[2] = refill_rate (tokens/s)
/// ARGV[3] = cost         ARGV[4] = now_ms
/// ARGV[5] = ttl_seconds
///
/// Returns {allowed (0/1), remaining, retry_after_ms, reset_at_unix}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key    = KEYS[1]
local max    = tonumber(ARGV[1])
local rate   = tonumber(ARGV[2])
local cost   = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])
local ttl    = tonumber(ARGV[5])

local data    = redis.call("HMGET", key, "tokens", "last_ms")
local tokens  = tonumber(data[1])
local last_ms = tonumber(data[2])

if tokens == nil then
    tokens  = max
    last_ms = now_ms
end

local elapsed_s = (now_ms - last_ms) / 1000.0
if elapsed_s > 0 then
    tokens = math.min(max, tokens + elapsed_s * rate)
    last_ms = now_ms
end

local allowed   = 0
local remaining = math.floor(tokens)
local retry_ms  = 0

if tokens >= cost then
    tokens    = tokens - cost
    remaining = math.floor(tokens)
    allowed   = 1
else
    local deficit = cost - tokens
    retry_ms = math.ceil((deficit / rate) * 1000)
end

redis.call("HMSET", key, "tokens", tostring(tokens), "last_ms", tostring(last_ms))
redis.call("EXPIRE", key, ttl)

local deficit_full = max - tokens
local reset_s = 0
if deficit_full > 0 and rate > 0 then
    reset_s = deficit_full / rate
end
local reset_at = math.floor(now_ms / 1000) + math.ceil(reset_s)

return {allowed, remaining, retry_ms, reset_at}
"#;

/// Redis-backed [`Store`].
#[derive(Clone)]
pub struct RedisStore {
    inner: Arc<RedisStoreInner>,
}

struct RedisStoreInner {
    client: redis::Client,
    prefix: String,
    script: Script,
}

impl RedisStore {
    /// Create from an existing [`redis::Client`]. All keys are namespaced
    /// with `prefix`.
    pub fn from_client(client: redis::Client, prefix: impl ToString) -> Self {
        Self {
            inner: Arc::new(RedisStoreInner {
                client,
                prefix: prefix.to_string(),
                script: Script::new(TOKEN_BUCKET_SCRIPT),
            }),
        }
    }

    /// Create from the rate-limit configuration.
    pub fn from_config(cfg: &RateLimitConfig) -> Result<Self, Error> {
        let client = redis::Client::open(cfg.redis.url())?;
        Ok(Self::from_client(client, &cfg.redis_prefix))
    }

    async fn try_allow(
        &self,
        key: &str,
        policy: &Policy,
        cost: u32,
    ) -> RedisResult<Decision> {
        let full_key = format!("{}{}", self.inner.prefix, key);
        let mut conn = self.inner.conn().await?;

        let now_ms = Utc::now().timestamp_millis();
        let ttl_seconds = (policy.window.as_secs() * 2).max(1);

        let (allowed, remaining, retry_ms, reset_at): (i64, i64, i64, i64) = self
            .inner
            .script
            .key(&full_key)
            .arg(f64::from(policy.max_tokens()))
            .arg(policy.refill_rate())
            .arg(cost)
            .arg(now_ms)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await?;

        let allowed = allowed == 1;
        let mut retry_after = (retry_ms / 1000).max(0) as u64;
        if !allowed && retry_after < 1 {
            retry_after = 1;
        }

        Ok(Decision {
            allowed,
            limit: policy.max_tokens(),
            remaining: remaining.clamp(0, i64::from(u32::MAX)) as u32,
            retry_after: if allowed { 0 } else { retry_after },
            reset_at,
        })
    }
}

fn fail_open(policy: &Policy) -> Decision {
    Decision {
        allowed: true,
        limit: policy.max_tokens(),
        remaining: policy.max_tokens(),
        retry_after: 0,
        reset_at: 0,
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn allow(&self, key: &str, policy: &Policy, cost: u32) -> Decision {
        match self.try_allow(key, policy, cost).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, scope = %policy.scope, "redis store unavailable, admitting");
                fail_open(policy)
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), Error> {
        let full_key = format!("{}{}", self.inner.prefix, key);
        let mut conn = self.inner.conn().await?;
        let _: () = conn.del(full_key).await?;
        Ok(())
    }

    /// Connections close when the client is dropped; nothing to do here.
    async fn close(&self) {}
}

impl RedisStoreInner {
    async fn conn(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }
}

/// Check-and-increment under the limit, refreshing the safety TTL so a
/// missed release cannot pin a slot forever.
const CONCURRENCY_ACQUIRE_SCRIPT: &str = r#"
local key   = KEYS[1]
local limit = tonumber(ARGV[1])
local ttl   = tonumber(ARGV[2])
local cur   = tonumber(redis.call("GET", key) or "0")
if cur >= limit then
    return 0
end
redis.call("INCR", key)
redis.call("EXPIRE", key, ttl)
return 1
"#;

/// Redis-backed [`ConcurrencyStore`] using a plain counter per key.
#[derive(Clone)]
pub struct RedisConcurrencyStore {
    inner: Arc<RedisConcurrencyInner>,
}

struct RedisConcurrencyInner {
    client: redis::Client,
    prefix: String,
    ttl: Duration,
    script: Script,
}

impl RedisConcurrencyStore {
    /// `ttl` bounds how long a leaked slot can survive a missed release.
    pub fn new(client: redis::Client, prefix: impl ToString, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RedisConcurrencyInner {
                client,
                prefix: format!("{}conc:", prefix.to_string()),
                ttl,
                script: Script::new(CONCURRENCY_ACQUIRE_SCRIPT),
            }),
        }
    }

    async fn try_acquire(&self, key: &str, limit: u32) -> RedisResult<bool> {
        let full_key = format!("{}{}", self.inner.prefix, key);
        let mut conn = self.inner.client.get_multiplexed_async_connection().await?;
        let taken: i64 = self
            .inner
            .script
            .key(&full_key)
            .arg(limit)
            .arg(self.inner.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    async fn try_release(&self, key: &str) -> RedisResult<()> {
        let full_key = format!("{}{}", self.inner.prefix, key);
        let mut conn = self.inner.client.get_multiplexed_async_connection().await?;
        let count: i64 = conn.decr(&full_key, 1).await?;
        if count <= 0 {
            let _: () = conn.del(&full_key).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConcurrencyStore for RedisConcurrencyStore {
    async fn acquire(&self, key: &str, limit: u32) -> bool {
        match self.try_acquire(key, limit).await {
            Ok(taken) => taken,
            Err(e) => {
                warn!(error = %e, "redis concurrency store unavailable, admitting");
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.try_release(key).await {
            warn!(error = %e, "redis concurrency release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn unreachable_client() -> redis::Client {
        // Nothing listens on port 1; connection attempts fail fast.
        redis::Client::open("redis://127.0.0.1:1/0").unwrap()
    }

    #[tokio::test]
    async fn store_fails_open_when_unreachable() {
        let store = RedisStore::from_client(unreachable_client(), "test:rl:");
        let policy = Policy {
            limit: 10,
            window: Duration::from_secs(60),
            burst: 5,
            scope: "test".to_string(),
            ..Policy::default()
        };

        let decision = store.allow("ip:1.2.3.4", &policy, 1).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 15);
        assert_eq!(decision.remaining, 15, "fail-open reports a full bucket");

        store.close().await;
    }

    #[tokio::test]
    async fn reset_reports_transport_errors() {
        let store = RedisStore::from_client(unreachable_client(), "test:rl:");
        assert!(store.reset("ip:1.2.3.4").await.is_err());
    }

    #[tokio::test]
    async fn concurrency_fails_open_when_unreachable() {
        let cs = RedisConcurrencyStore::new(
            unreachable_client(),
            "test:rl:",
            Duration::from_secs(30),
        );
        assert!(cs.acquire("ip:1.2.3.4", 1).await);
        // release must swallow the error
        cs.release("ip:1.2.3.4").await;
    }
}
