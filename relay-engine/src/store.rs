//! # In-Memory Cache Facade
//!
//! `CacheStore` over `MemoryEngine`. There is no network here, so no call ever
//! fails for availability; TTL refresh and atomic increment fail with
//! `NotSupported` because they need the distributed backend's semantics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use relay_common::{CacheError, CacheResult, CacheStore, GlobPattern, KeyStream};

use crate::memory::{ExpirationHandle, MemoryEngine};

/// Single-process `CacheStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    engine: Arc<MemoryEngine>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_engine(Arc::new(MemoryEngine::new()))
    }

    pub fn with_engine(engine: Arc<MemoryEngine>) -> Self {
        MemoryCache { engine }
    }

    /// Starts the background sweeper for the underlying engine.
    pub fn start_expirer(&self, interval: Duration) -> ExpirationHandle {
        self.engine.start_expirer(interval)
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn string_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.engine.set(key, value, ttl);
        Ok(())
    }

    async fn string_get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.engine.get(key).map(|value| value.to_string()))
    }

    async fn update_expiration(&self, _key: &str, _ttl: Duration) -> CacheResult<bool> {
        Err(CacheError::NotSupported {
            operation: "update_expiration",
        })
    }

    async fn key_delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.engine.delete(key))
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.engine.contains(key))
    }

    async fn string_increment(&self, _key: &str, _by: i64) -> CacheResult<i64> {
        Err(CacheError::NotSupported {
            operation: "string_increment",
        })
    }

    fn scan_keys(&self, pattern: &str) -> KeyStream {
        let pattern = GlobPattern::new(pattern);
        let engine = Arc::clone(&self.engine);
        let keys = engine.registered_keys();

        // Liveness is checked as the stream is polled, not at snapshot time.
        stream::iter(keys)
            .filter_map(move |key| {
                let keep = pattern.matches(&key) && engine.contains(&key);
                futures::future::ready(keep.then(|| Ok::<_, CacheError>(key.to_string())))
            })
            .boxed()
    }
}
