// relay-common - Shared error, configuration, and facade definitions for Relay
//
// This crate defines the contract every cache backend honors: the
// `CacheStore` facade, the error taxonomy, and the pool/retry options.

pub mod config;
pub mod error;
pub mod pattern;
pub mod store;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use pattern::*;
pub use store::*;
