//! In-process store, suitable for development and single-instance
//! deployments. Bucket state does not survive a restart.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::bucket::{Bucket, Decision};
use crate::error::Error;
use crate::policy::Policy;
use crate::store::{ConcurrencyStore, Store};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

struct MemEntry {
    bucket: Bucket,
    expires_at: Instant,
}

/// Thread-safe in-memory [`Store`] with one token bucket per key.
///
/// Entries live for two windows past their last touch; a background sweeper
/// deletes expired ones. The sweeper holds only a [`Weak`] reference to the
/// bucket map, so dropping the store without calling
/// [`close`](Store::close) still lets the task wind down on its next tick.
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct MemStore {
    entries: Arc<Mutex<HashMap<String, MemEntry>>>,
    stop: Arc<Notify>,
    sweeper: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl MemStore {
    /// Create a store whose sweeper runs every `sweep_interval`.
    pub fn new(sweep_interval: Duration) -> Self {
        let entries: Arc<Mutex<HashMap<String, MemEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(Notify::new());

        let weak: Weak<Mutex<HashMap<String, MemEntry>>> = Arc::downgrade(&entries);
        let stop_signal = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = ticker.tick() => {
                        let Some(entries) = weak.upgrade() else { break };
                        let now = Instant::now();
                        entries.lock().await.retain(|_, entry| entry.expires_at > now);
                    }
                }
            }
        });

        Self {
            entries,
            stop,
            sweeper: Arc::new(parking_lot::Mutex::new(Some(handle))),
        }
    }

    /// Number of live bucket entries. Mostly useful in tests and metrics.
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn allow(&self, key: &str, policy: &Policy, cost: u32) -> Decision {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| MemEntry {
                bucket: Bucket::new(policy),
                expires_at: now + policy.window * 2,
            });
        // keep alive for two windows past the last touch
        entry.expires_at = now + policy.window * 2;

        let (remaining, allowed) = entry.bucket.allow(cost, now);

        let mut decision = Decision {
            allowed,
            limit: policy.max_tokens(),
            remaining,
            retry_after: 0,
            reset_at: entry.bucket.reset_unix(),
        };
        if !allowed {
            decision.retry_after = entry.bucket.retry_after(cost).max(1);
        }
        decision
    }

    async fn reset(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn close(&self) {
        self.stop.notify_one();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// In-process [`ConcurrencyStore`]. Keys whose count reaches zero are
/// removed so the map stays bounded by the number of in-flight requests.
#[derive(Default)]
pub struct MemConcurrencyStore {
    inflight: parking_lot::Mutex<HashMap<String, u32>>,
}

impl MemConcurrencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConcurrencyStore for MemConcurrencyStore {
    async fn acquire(&self, key: &str, limit: u32) -> bool {
        let mut inflight = self.inflight.lock();
        let current = inflight.get(key).copied().unwrap_or(0);
        if current >= limit {
            return false;
        }
        inflight.insert(key.to_string(), current + 1);
        true
    }

    async fn release(&self, key: &str) {
        let mut inflight = self.inflight.lock();
        if let Some(count) = inflight.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inflight.remove(key);
            }
        }
    }
}
