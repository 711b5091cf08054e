//! # Relay In-Memory Fallback
//!
//! Purpose: A single-process substitute for the distributed cache, honoring
//! the same `CacheStore` contract for deployments with no external cache.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **TTL Fast Path**: Expiration is checked on access; a sweeper reclaims the rest.
//! 3. **Honest Gaps**: Operations that need the real backend fail fast instead
//!    of approximating.

mod memory;
mod store;

pub use memory::{ExpirationHandle, MemoryEngine};
pub use store::MemoryCache;
