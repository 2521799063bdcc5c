//! Pluggable key-value storage used to persist credential pool state.
//!
//! The gateway never picks a backend on its own: `main` constructs the store
//! and hands it to [`crate::credentials::PoolRegistry`]. [`MemoryStore`] is
//! the implementation shipped with the binary and is sufficient for a
//! long-lived process; hosted deployments can plug in an external store by
//! implementing [`KvStore`].

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

/// Minimal async key-value contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value, or `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

/// Every this many writes, [`MemoryStore`] sweeps out expired entries.
const SWEEP_EVERY: u64 = 1024;

/// In-process store backed by a [`DashMap`].
///
/// Expired entries are evicted lazily on `get`, and swept periodically on
/// `set` so keys that are never read again do not pile up.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let expired = match self.slots.get(key) {
            None => return Ok(None),
            Some(slot) => match slot.expires_at {
                Some(at) if Instant::now() >= at => true,
                _ => return Ok(Some(slot.value.clone())),
            },
        };
        if expired {
            self.slots.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> anyhow::Result<()> {
        let now = Instant::now();
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.slots
                .retain(|_, slot| !matches!(slot.expires_at, Some(at) if now >= at));
        }
        let expires_at = ttl.map(|ttl| now + ttl);
        self.slots.insert(key.to_owned(), Slot { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.slots.remove(key);
        Ok(())
    }
}
