//! Rotating pool of upstream credentials.
//!
//! A [`CredentialPool`] is a fixed-size ring of credentials guarded by a single
//! [`tokio::sync::Mutex`]. Every selection advances one pool-wide cursor, so
//! each credential is visited once before any repeats. Temporary states
//! (cooldown, suspension) carry an `until` instant and are resolved lazily the
//! next time the credential is examined; nothing clears them out-of-band.
//!
//! Pool state is written through to a [`KvStore`] after every mutating call so
//! that a fresh process (or a stateless invocation) can pick up where the last
//! one left off.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::KvStore;

/// Snapshots of pools nobody uses expire from the store after this long.
/// Longer than any suspension, so an idle pool never forgets a live one.
const SNAPSHOT_TTL: std::time::Duration = std::time::Duration::from_secs(48 * 60 * 60);

/// Availability of a single credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    /// Short-lived unavailability after a transient failure.
    Cooldown { until: DateTime<Utc> },
    /// Unavailable until a calendar-day boundary (rate limited).
    Suspended { until: DateTime<Utc> },
}

impl CredentialState {
    fn until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Available => None,
            Self::Cooldown { until } | Self::Suspended { until } => Some(*until),
        }
    }
}

/// A credential handed out by [`CredentialPool::next_available`].
///
/// `slot` is the credential's stable position in the pool; it is what the
/// `mark_*` methods use to find the entry again.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub slot: usize,
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("slot", &self.slot)
            .field("secret", &mask(&self.secret))
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    secret: String,
    state: CredentialState,
}

#[derive(Debug)]
struct Ring {
    cursor: usize,
    entries: Vec<Entry>,
}

/// Persisted form of a pool. Secrets are never written to storage.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    cursor: usize,
    credentials: Vec<CredentialState>,
}

pub struct CredentialPool {
    ring: Mutex<Ring>,
    store: Arc<dyn KvStore>,
    storage_key: String,
    suspension_tz: Tz,
}

impl CredentialPool {
    /// Build a pool from a comma-separated list, all entries `available`.
    ///
    /// Entries are trimmed; blank entries are dropped. An absent or empty list
    /// yields a pool of size 0.
    pub fn new(raw: Option<&str>, suspension_tz: Tz, store: Arc<dyn KvStore>) -> Self {
        let secrets = split_list(raw);
        let storage_key = storage_key(&secrets);
        let entries = secrets
            .into_iter()
            .map(|secret| Entry {
                secret,
                state: CredentialState::Available,
            })
            .collect();
        Self {
            ring: Mutex::new(Ring { cursor: 0, entries }),
            store,
            storage_key,
            suspension_tz,
        }
    }

    /// Build a pool and hydrate cursor and states from a previously stored snapshot.
    ///
    /// A snapshot whose length does not match the list is ignored.
    pub async fn load(raw: Option<&str>, suspension_tz: Tz, store: Arc<dyn KvStore>) -> Self {
        let pool = Self::new(raw, suspension_tz, store);
        let stored = match pool.store.get(&pool.storage_key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to read credential pool snapshot");
                None
            }
        };
        let Some(stored) = stored else {
            return pool;
        };
        match serde_json::from_str::<Snapshot>(&stored) {
            Ok(snapshot) => {
                let mut ring = pool.ring.lock().await;
                if snapshot.credentials.len() == ring.entries.len() && !ring.entries.is_empty() {
                    ring.cursor = snapshot.cursor % ring.entries.len();
                    for (entry, state) in ring.entries.iter_mut().zip(snapshot.credentials) {
                        entry.state = state;
                    }
                    debug!(size = ring.entries.len(), cursor = ring.cursor, "restored credential pool");
                }
            }
            Err(e) => warn!(error = %e, "discarding unreadable credential pool snapshot"),
        }
        pool
    }

    /// Pool cardinality; the dispatcher's retry budget.
    pub async fn size(&self) -> usize {
        self.ring.lock().await.entries.len()
    }

    pub async fn next_available(&self) -> Option<Credential> {
        self.next_available_at(Utc::now()).await
    }

    /// Scan at most one full cycle starting at the cursor.
    ///
    /// The cursor moves past every examined position whether or not it is a
    /// hit. Expired cooldowns/suspensions are flipped to `available` on the
    /// spot and the credential is returned.
    pub async fn next_available_at(&self, now: DateTime<Utc>) -> Option<Credential> {
        let mut ring = self.ring.lock().await;
        let size = ring.entries.len();
        if size == 0 {
            return None;
        }

        let start = ring.cursor;
        let mut hit = None;
        let mut transitioned = false;
        for _ in 0..size {
            let slot = ring.cursor;
            ring.cursor = (slot + 1) % size;
            let entry = &mut ring.entries[slot];
            debug!(credential = %mask(&entry.secret), state = ?entry.state, "examining credential");

            match entry.state.until() {
                None => {}
                Some(until) if now >= until => {
                    info!(credential = %mask(&entry.secret), "credential available again");
                    entry.state = CredentialState::Available;
                    transitioned = true;
                }
                Some(_) => continue,
            }
            hit = Some(Credential {
                slot,
                secret: entry.secret.clone(),
            });
            break;
        }

        if transitioned || ring.cursor != start {
            self.persist(&ring).await;
        }
        hit
    }

    /// Put a credential in `cooldown(now + duration)`.
    pub async fn mark_cooldown(&self, credential: &Credential, duration: Duration) {
        self.mark_cooldown_at(credential, duration, Utc::now()).await
    }

    pub async fn mark_cooldown_at(&self, credential: &Credential, duration: Duration, now: DateTime<Utc>) {
        let until = now + duration;
        self.set_state(credential, CredentialState::Cooldown { until }).await;
        warn!(credential = %mask(&credential.secret), %until, "credential cooling down");
    }

    /// Suspend a credential until the next local midnight in the pool's time zone.
    pub async fn mark_suspended(&self, credential: &Credential) {
        self.mark_suspended_at(credential, Utc::now()).await
    }

    pub async fn mark_suspended_at(&self, credential: &Credential, now: DateTime<Utc>) {
        let until = next_local_midnight(now, self.suspension_tz);
        self.set_state(credential, CredentialState::Suspended { until }).await;
        warn!(credential = %mask(&credential.secret), %until, "credential suspended");
    }

    /// Current state of every credential, in pool order.
    pub async fn states(&self) -> Vec<CredentialState> {
        self.ring.lock().await.entries.iter().map(|e| e.state).collect()
    }

    async fn set_state(&self, credential: &Credential, state: CredentialState) {
        let mut ring = self.ring.lock().await;
        match ring.entries.get_mut(credential.slot) {
            Some(entry) if entry.secret == credential.secret => entry.state = state,
            _ => {
                warn!(slot = credential.slot, "credential not found in pool; state change ignored");
                return;
            }
        }
        self.persist(&ring).await;
    }

    async fn persist(&self, ring: &Ring) {
        let snapshot = Snapshot {
            cursor: ring.cursor,
            credentials: ring.entries.iter().map(|e| e.state).collect(),
        };
        let result = match serde_json::to_string(&snapshot) {
            Ok(json) => self.store.set(&self.storage_key, json, Some(SNAPSHOT_TTL)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist credential pool state");
        }
    }
}

/// One shared pool per distinct credential list.
///
/// Requests may bring their own list in the `Authorization` header; routing
/// them all to the same [`CredentialPool`] keeps cursor and cooldowns intact
/// across requests in a long-lived process.
///
/// At most `capacity` pools are held. The least recently used one is dropped
/// to make room; its state is already in the store and is restored by
/// [`CredentialPool::load`] if the list comes back.
pub struct PoolRegistry {
    pools: DashMap<String, Registered>,
    store: Arc<dyn KvStore>,
    suspension_tz: Tz,
    capacity: usize,
    clock: AtomicU64,
}

struct Registered {
    pool: Arc<CredentialPool>,
    last_used: AtomicU64,
}

impl PoolRegistry {
    pub fn new(store: Arc<dyn KvStore>, suspension_tz: Tz, capacity: usize) -> Self {
        Self {
            pools: DashMap::new(),
            store,
            suspension_tz,
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Return the pool for `raw`, creating (and hydrating) it on first use.
    pub async fn pool_for(&self, raw: Option<&str>) -> Arc<CredentialPool> {
        let key = split_list(raw).join(",");
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.pools.get(&key) {
            entry.last_used.store(tick, Ordering::Relaxed);
            return Arc::clone(&entry.pool);
        }
        let pool = Arc::new(
            CredentialPool::load(Some(&key), self.suspension_tz, Arc::clone(&self.store)).await,
        );
        while self.pools.len() >= self.capacity {
            if !self.evict_least_recent() {
                break;
            }
        }
        let pool = Arc::clone(
            &self
                .pools
                .entry(key)
                .or_insert(Registered {
                    pool,
                    last_used: AtomicU64::new(tick),
                })
                .pool,
        );
        debug!(pools = self.len(), "credential pool registered");
        pool
    }

    fn evict_least_recent(&self) -> bool {
        let oldest = self
            .pools
            .iter()
            .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());
        match oldest {
            Some(key) => {
                self.pools.remove(&key);
                debug!("evicted least recently used credential pool");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }
}

/// Next midnight, in `tz`, strictly after `now`.
///
/// Computed on the calendar date of `now` in `tz` and converted back through
/// the zone's rules, so the boundary is correct on both sides of a DST change.
/// If midnight does not exist that day (a zone that springs forward at 00:00)
/// the first instant after the gap is used.
pub fn next_local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let Some(tomorrow) = today.succ_opt() else {
        return now + Duration::hours(24);
    };
    let midnight = tomorrow.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| now + Duration::hours(24))
}

/// Render a secret for logs: `abcd****wxyz`, or `****` when too short to show.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_owned();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn storage_key(secrets: &[String]) -> String {
    let digest = Sha256::digest(secrets.join(",").as_bytes());
    format!("credential-pool:{}", hex::encode(digest))
}
