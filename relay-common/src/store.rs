//! # Cache Facade Contract
//!
//! Purpose: The narrow command surface the rest of the backend (presence,
//! notification counters, sessions, token exchange) consumes. Exactly one
//! implementation is wired in at startup; callers never see pools or leases.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CacheResult;

/// Lazy, finite sequence of keys produced by one scan invocation.
///
/// Each `scan_keys` call starts from the beginning; a stream cannot be resumed
/// once dropped.
pub type KeyStream = BoxStream<'static, CacheResult<String>>;

/// String-keyed cache operations shared by every backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value and TTL.
    async fn string_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    async fn string_get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Refreshes the TTL of an existing key without touching its value.
    ///
    /// Returns true when the key existed.
    async fn update_expiration(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Deletes a key. Returns true when a key was removed.
    async fn key_delete(&self, key: &str) -> CacheResult<bool>;

    async fn key_exists(&self, key: &str) -> CacheResult<bool>;

    /// Atomically adds `by` to the integer stored at `key` and returns the
    /// new value.
    async fn string_increment(&self, key: &str, by: i64) -> CacheResult<i64>;

    /// Starts a fresh scan over keys matching a glob `pattern`.
    ///
    /// Only `*` (any run) and `?` (any one character) are wildcards; every
    /// other character, `[`, `]` and `\` included, matches itself on every
    /// backend.
    fn scan_keys(&self, pattern: &str) -> KeyStream;
}
