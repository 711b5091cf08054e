//! # Expiring Sharded Map
//!
//! Provide the process-local key/value store behind `MemoryCache`: sharded
//! locking, TTL-aware lookups, and a key registry that backs pattern scans.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryEngine
//!   ├── shards: Vec<Shard>
//!   │     └── Shard
//!   │           └── inner: RwLock<HashMap<Arc<str>, Entry>>
//!   │                 └── Entry { value, expires_at }
//!   └── registry: Mutex<HashSet<Arc<str>>>   (every live key, for scans)
//! ```
//!
//! Lock order is always shard first, then registry. Scans snapshot the
//! registry and release it before touching any shard.

use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

#[derive(Debug)]
struct Entry {
    value: Arc<str>,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    /// Returns true when the entry has expired at `now`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug)]
struct Shard {
    inner: RwLock<HashMap<Arc<str>, Entry, RandomState>>,
}

/// Sharded in-memory store with per-entry expiry.
#[derive(Debug)]
pub struct MemoryEngine {
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    hash_state: RandomState,
    /// Every key currently stored, expired-but-unswept ones included.
    registry: Mutex<HashSet<Arc<str>, RandomState>>,
}

/// Handle for the background expiration sweeper.
///
/// Call `stop` to signal shutdown and wait for the task to finish.
pub struct ExpirationHandle {
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ExpirationHandle {
    /// Stops the sweeper and waits for the task to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for ExpirationHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates a new engine with a default shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a new engine with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            })
            .collect();

        MemoryEngine {
            shards,
            shard_mask: shard_count - 1,
            registry: Mutex::new(HashSet::with_hasher(hash_state.clone())),
            hash_state,
        }
    }

    /// Looks up a key, dropping it if it has expired.
    ///
    /// **Input**: `key` to read.
    /// **Output**: the shared value, or `None` when missing or expired.
    ///
    /// **Logic**:
    /// 1. Take the shard write lock so an expired entry can be removed in place.
    /// 2. Remove an expired entry from the shard, then from the registry.
    /// 3. Otherwise clone the `Arc` value out.
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();

        let expired = inner.get(key)?.is_expired(now);
        if expired {
            inner.remove(key);
            self.registry.lock().remove(key);
            return None;
        }
        inner.get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// Inserts or replaces a key, resetting its TTL to `ttl`.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let key: Arc<str> = Arc::from(key);
        let entry = Entry {
            value: Arc::from(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };

        let mut inner = self.shard_for(&key).inner.write();
        if inner.insert(Arc::clone(&key), entry).is_none() {
            self.registry.lock().insert(key);
        }
    }

    /// Deletes a key and returns whether a live entry was removed.
    ///
    /// Expired entries are treated as missing.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        match inner.remove(key) {
            Some(entry) => {
                self.registry.lock().remove(key);
                !entry.is_expired(now)
            }
            None => false,
        }
    }

    /// Returns true when `key` holds an unexpired value.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let inner = self.shard_for(key).inner.read();
        inner
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Copies the key registry.
    ///
    /// The snapshot may include keys that expire before the caller looks at
    /// them; check `contains` per key.
    pub fn registered_keys(&self) -> Vec<Arc<str>> {
        self.registry.lock().iter().cloned().collect()
    }

    /// Number of registered keys, expired-but-unswept ones included.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan and is intended for a periodic background sweep.
    ///
    /// **Input**: `now`, the instant expiry is judged against.
    /// **Output**: number of entries removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            let expired: Vec<Arc<str>> = inner
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| Arc::clone(key))
                .collect();
            if expired.is_empty() {
                continue;
            }

            let mut registry = self.registry.lock();
            for key in expired {
                inner.remove(&key);
                registry.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Starts a background task that periodically removes expired entries.
    ///
    /// Must be called from within a tokio runtime. The returned handle stops
    /// the task on `stop` or when dropped.
    pub fn start_expirer(self: &Arc<Self>, interval: Duration) -> ExpirationHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let engine = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = engine.purge_expired(Instant::now());
                        if removed > 0 {
                            tracing::debug!(removed, "purged expired entries");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        ExpirationHandle {
            stop: Some(stop_tx),
            join: Some(join),
        }
    }

    /// Hashes a key to its owning shard.
    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key.as_bytes());
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    count.max(1).next_power_of_two()
}
