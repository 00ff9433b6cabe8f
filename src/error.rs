use thiserror::Error;

/// Errors surfaced by the rate limiter.
///
/// Runtime backend failures (Redis transport errors, log-write failures) are
/// handled internally with a fail-open policy and never reach the HTTP
/// client; this type mostly shows up at construction time.
#[derive(Debug, Error)]
pub enum Error {
    /// The policy cannot produce a working token bucket.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Redis client or transport error.
    #[cfg(feature = "redis-store")]
    #[error("redis store: {0}")]
    Redis(#[from] redis::RedisError),

    /// The deny-log database rejected a statement or the pool produced no
    /// connection.
    #[cfg(feature = "postgres-log")]
    #[error("database: {0}")]
    Database(String),

    /// A deny-log entry could not be written.
    #[error("deny-log write failed: {0}")]
    LogWrite(String),
}
