//! Deny logging: best-effort persistence of denied requests.
//!
//! Write failures are reported through the returned error and logged by the
//! middleware; they never influence the HTTP response.

use crate::error::Error;
use crate::keys::KeyKind;

/// A single denied-request record. `denied_at` is stamped by the sink.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub method: String,
    pub path: String,
    pub key_type: KeyKind,
    /// Safe-to-store fingerprint of the key (already hashed and truncated).
    pub key_hash: String,
    pub scope: String,
    pub retry_after: u64,
    pub client_ip: String,
}

/// Sink for denied-request records.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    async fn log(&self, entry: LogEntry) -> Result<(), Error>;
}

/// Discards all entries. Used when deny logging is disabled.
pub struct NopLogStore;

#[async_trait::async_trait]
impl LogStore for NopLogStore {
    async fn log(&self, _entry: LogEntry) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(feature = "postgres-log")]
pub use self::db::DbLogStore;

#[cfg(feature = "postgres-log")]
mod db {
    use r2d2::Pool;
    use r2d2_postgres::{postgres::NoTls, PostgresConnectionManager};

    use super::{Error, LogEntry, LogStore};

    /// Writes denied-request records to the `rate_limit_logs` table through
    /// a pooled Postgres connection. The insert runs on the blocking thread
    /// pool so the request path is never stalled on the driver.
    ///
    /// The table is owned by the embedding application's migrations:
    ///
    /// ```sql
    /// CREATE TABLE rate_limit_logs (
    ///     id          BIGSERIAL PRIMARY KEY,
    ///     method      TEXT        NOT NULL,
    ///     path        TEXT        NOT NULL,
    ///     key_type    TEXT        NOT NULL,
    ///     key_hash    TEXT        NOT NULL,
    ///     scope       TEXT        NOT NULL,
    ///     retry_after INTEGER     NOT NULL,
    ///     client_ip   TEXT        NOT NULL,
    ///     denied_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    ///     created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    /// );
    /// CREATE INDEX rate_limit_logs_scope_idx    ON rate_limit_logs (scope, denied_at DESC);
    /// CREATE INDEX rate_limit_logs_ip_idx       ON rate_limit_logs (client_ip, denied_at DESC);
    /// CREATE INDEX rate_limit_logs_key_hash_idx ON rate_limit_logs (key_hash, denied_at DESC);
    /// ```
    pub struct DbLogStore {
        pool: Pool<PostgresConnectionManager<NoTls>>,
    }

    impl DbLogStore {
        pub fn new(pool: Pool<PostgresConnectionManager<NoTls>>) -> Self {
            Self { pool }
        }
    }

    #[async_trait::async_trait]
    impl LogStore for DbLogStore {
        async fn log(&self, entry: LogEntry) -> Result<(), Error> {
            let pool = self.pool.clone();
            let result = actix_web::web::block(move || {
                let mut client = pool.get().map_err(|e| Error::Database(e.to_string()))?;
                let denied_at = chrono::Utc::now();
                client
                    .execute(
                        "INSERT INTO rate_limit_logs \
                         (method, path, key_type, key_hash, scope, retry_after, client_ip, denied_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                        &[
                            &entry.method,
                            &entry.path,
                            &entry.key_type.as_str(),
                            &entry.key_hash,
                            &entry.scope,
                            &(entry.retry_after as i32),
                            &entry.client_ip,
                            &denied_at,
                        ],
                    )
                    .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await;

            match result {
                Ok(inner) => inner,
                Err(e) => Err(Error::LogWrite(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nop_store_swallows_entries() {
        let store = NopLogStore;
        let entry = LogEntry {
            method: "GET".into(),
            path: "/".into(),
            key_type: KeyKind::Ip,
            key_hash: "ip:1.2.3.4".into(),
            scope: "test".into(),
            retry_after: 1,
            client_ip: "1.2.3.4".into(),
        };
        store.log(entry).await.unwrap();
    }
}
