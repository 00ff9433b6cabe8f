//! Rate-limiter configuration.
//!
//! Everything is optional with sensible defaults. [`RateLimitConfig`] can be
//! deserialized from the embedding application's config file or read from
//! `RATE_LIMIT_*` environment variables via [`RateLimitConfig::from_env`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::client_ip::TrustedProxies;
use crate::error::Error;
use crate::policy::Policy;

/// Body format for 429 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Json,
    Html,
}

impl Default for ResponseFormat {
    fn default() -> Self {
        ResponseFormat::Json
    }
}

impl FromStr for ResponseFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ResponseFormat::Json),
            "html" => Ok(ResponseFormat::Html),
            other => Err(Error::InvalidPolicy(format!(
                "unknown response format {:?}",
                other
            ))),
        }
    }
}

/// Connection details for the Redis backend. Defaults inherit the session
/// store's settings so one Redis serves both unless overridden.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

/// All rate-limiter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Master on/off switch.
    pub enabled: bool,

    /// Backing store: `memory` or `redis`.
    pub store: String,

    /// Key namespace on the Redis store.
    pub redis_prefix: String,

    /// IPs/CIDRs allowed to set forwarded headers.
    pub trusted_proxies: Vec<String>,

    /// Default body format for 429 responses.
    pub response_format: ResponseFormat,

    /// Whether denied requests are written to the database.
    pub log_table_enabled: bool,

    /// Fallback policy values used when a route sets no policy of its own.
    pub default_limit: u32,
    pub default_window_secs: u64,
    pub default_burst: u32,

    pub redis: RedisConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: "memory".to_string(),
            redis_prefix: "gohst:rl:".to_string(),
            trusted_proxies: Vec::new(),
            response_format: ResponseFormat::Json,
            log_table_enabled: false,
            default_limit: 300,
            default_window_secs: 60,
            default_burst: 60,
            redis: RedisConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Read settings from `RATE_LIMIT_*` environment variables, falling back
    /// to the defaults above. Redis connection values additionally fall back
    /// to the `SESSION_REDIS_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("RATE_LIMIT_ENABLED", defaults.enabled),
            store: env_string("RATE_LIMIT_STORE", &defaults.store),
            redis_prefix: env_string("RATE_LIMIT_REDIS_PREFIX", &defaults.redis_prefix),
            trusted_proxies: split_csv(&env_string("RATE_LIMIT_TRUSTED_PROXIES", "")),
            response_format: env_format("RATE_LIMIT_RESPONSE_FORMAT"),
            log_table_enabled: env_bool("RATE_LIMIT_LOG_TABLE", defaults.log_table_enabled),
            default_limit: env_parse("RATE_LIMIT_DEFAULT_LIMIT", defaults.default_limit),
            default_window_secs: env_parse(
                "RATE_LIMIT_DEFAULT_WINDOW",
                defaults.default_window_secs,
            ),
            default_burst: env_parse("RATE_LIMIT_DEFAULT_BURST", defaults.default_burst),
            redis: RedisConfig {
                host: env_string(
                    "RATE_LIMIT_REDIS_HOST",
                    &env_string("SESSION_REDIS_HOST", &defaults.redis.host),
                ),
                port: env_parse(
                    "RATE_LIMIT_REDIS_PORT",
                    env_parse("SESSION_REDIS_PORT", defaults.redis.port),
                ),
                password: env_string(
                    "RATE_LIMIT_REDIS_PASSWORD",
                    &env_string("SESSION_REDIS_PASSWORD", ""),
                ),
                db: env_parse("RATE_LIMIT_REDIS_DB", defaults.redis.db),
            },
        }
    }

    /// The fallback policy built from the `default_*` values.
    pub fn default_policy(&self) -> Result<Policy, Error> {
        let policy = Policy {
            limit: self.default_limit,
            window: Duration::from_secs(self.default_window_secs),
            burst: self.default_burst,
            ..Policy::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Parsed trusted-proxy list.
    pub fn trusted(&self) -> TrustedProxies {
        TrustedProxies::parse(self.trusted_proxies.iter())
    }

    /// Build a deny-log sink: the database sink when `log_table_enabled`,
    /// otherwise a no-op.
    #[cfg(feature = "postgres-log")]
    pub fn build_log_store(
        &self,
        pool: r2d2::Pool<r2d2_postgres::PostgresConnectionManager<r2d2_postgres::postgres::NoTls>>,
    ) -> std::sync::Arc<dyn crate::log::LogStore> {
        if self.log_table_enabled {
            std::sync::Arc::new(crate::log::DbLogStore::new(pool))
        } else {
            std::sync::Arc::new(crate::log::NopLogStore)
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(variable = name, value = %v, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_format(name: &str) -> ResponseFormat {
    match env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %v, "unknown response format, using json");
            ResponseFormat::Json
        }),
        Err(_) => ResponseFormat::Json,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
