//! # `gohst-ratelimit`: token-bucket rate limiting for `actix-web`

//! ## Description
//! `gohst-ratelimit` is a rate-limit middleware for the `actix-web` library.
//! Each key (IP, user, bearer token or a composite) owns a token bucket that
//! refills continuously at `limit / window` tokens per second, with optional
//! burst capacity on top, so short spikes pass while sustained abuse is held
//! to the configured rate.

//! ## Features
//! |     Feature     |        Component        |                              Description                               |
//! |:---------------:|:-----------------------:|:----------------------------------------------------------------------:|
//! |    `default`    |        `MemStore`       |                    Buckets in process memory                            |
//! |  `redis-store`  | `RedisStore`            | Shared buckets via [redis](https://crates.io/crates/redis), one atomic Lua script per check |
//! | `postgres-log`  | `DbLogStore`            | Denied requests recorded to Postgres through an `r2d2` pool             |

//! ## Usage
//! 1. Create a `Store` that holds bucket state: in-memory for a single
//!    instance, Redis when several instances must share limits.
//! 2. Pick a `Policy` (how much) and a `KeyStrategy` (who).
//! 3. Build a `RateLimit` middleware and add it to your server with `wrap`.

//! ### Store
//! ```rust,no_run
//! // sweeps expired buckets every 2 minutes (the default)
//! let store = gohst_ratelimit::store::MemStore::default();
//! ```

//! ### Policy and keys
//! ```rust
//! use std::time::Duration;
//! use gohst_ratelimit::keys::KeyStrategy;
//! use gohst_ratelimit::policy::Policy;
//!
//! let policy = Policy {
//!     limit: 50,
//!     window: Duration::from_secs(30),
//!     burst: 10,
//!     cost: 5, // expensive endpoints consume more tokens
//!     scope: "api_search".to_string(),
//!     ..Policy::default()
//! };
//! let keys = KeyStrategy::by_token_else_user_else_ip();
//! ```

//! ### Middleware
//! ```rust,ignore
//! let limiter = gohst_ratelimit::middleware::RateLimit::new(store, policy, keys)?;
//!
//! App::new()
//!     .wrap(limiter)
//!     // ...
//! ```

//! Preset constructors cover the common cases: `RateLimit::public_browse`,
//! `RateLimit::api_default`, `RateLimit::auth_sensitive("email")` and
//! `RateLimit::exports`.

//! ### Behind a reverse proxy
//! Forwarded headers are ignored unless the peer is explicitly trusted:
//! ```rust,ignore
//! let limiter = limiter.with_trusted_proxies(
//!     gohst_ratelimit::client_ip::TrustedProxies::parse(["10.0.0.0/8"]),
//! );
//! ```

//! ### Configuration
//! All settings can come from `RATE_LIMIT_*` environment variables:
//! ```rust,ignore
//! let cfg = gohst_ratelimit::config::RateLimitConfig::from_env();
//! let store = gohst_ratelimit::middleware::store_from_config(&cfg);
//! let limiter = gohst_ratelimit::middleware::RateLimit::new(
//!     store,
//!     cfg.default_policy()?,
//!     KeyStrategy::by_ip(),
//! )?
//! .enabled(cfg.enabled)
//! .with_trusted_proxies(cfg.trusted())
//! .with_response_format(cfg.response_format);
//! ```

//! On denial the middleware answers `429` with `Retry-After` and a JSON or
//! HTML body; on every limited response it sets `X-RateLimit-Limit`,
//! `X-RateLimit-Remaining` and `X-RateLimit-Reset`. Backend outages fail
//! open: the request is admitted and the event is logged.

pub mod allowlist;
pub mod bucket;
pub mod client_ip;
pub mod config;
pub mod error;
pub mod keys;
pub mod log;
pub mod middleware;
pub mod policy;
pub mod store;
pub mod utils;
