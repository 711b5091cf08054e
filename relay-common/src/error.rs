//! # Error Taxonomy and Classification
//!
//! Purpose: One error type for every cache backend, and a pure classifier that
//! turns a failure into a two-valued retry decision at the boundary where the
//! backing store raises it.
//!
//! ## Design Principles
//! 1. **No Wrapping**: Failures reach callers unchanged; retries never translate them.
//! 2. **Tagged Outcome**: Callers switch on `FailureClass`, not on error variants.
//! 3. **Fail Fast**: Anything not recognised as a stale-routing signal is fatal.

use std::io;

use thiserror::Error;

/// Result type shared by every cache backend.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the cache subsystem.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Backing store returned an error reply.
    #[error("server error: {message}")]
    Server { message: String },
    /// The connection is bound to a replica and cannot serve a write.
    #[error("endpoint {endpoint} is a replica and not eligible for writes")]
    ReplicaWrite { endpoint: String },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// No connection string is registered under the logical name.
    #[error("no connection string registered for `{name}`")]
    UnknownConnection { name: String },
    /// Operation deliberately not offered by this backend.
    #[error("operation `{operation}` is not supported by this cache backend")]
    NotSupported { operation: &'static str },
    /// Invalid pool or retry options.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The settings document did not parse.
    #[error("invalid cache settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),
    /// The pool has been shut down.
    #[error("connection pool is shutting down")]
    ShuttingDown,
}

impl CacheError {
    /// Builds a `Server` error from a raw RESP error payload.
    pub fn server(message: &[u8]) -> Self {
        CacheError::Server {
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }
}

/// Retry decision for a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Stale routing during failover; another connection may succeed.
    Retryable,
    /// Never retried.
    Fatal,
}

/// Classifies a failure raised by a cache command.
///
/// Read-only replies and replica write rejections are retryable; every other
/// failure is fatal.
pub fn classify(error: &CacheError) -> FailureClass {
    match error {
        CacheError::Server { message } if is_read_only_reply(message) => FailureClass::Retryable,
        CacheError::ReplicaWrite { .. } => FailureClass::Retryable,
        _ => FailureClass::Fatal,
    }
}

/// Returns true for replies a replica sends when asked to write.
pub fn is_read_only_reply(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.starts_with("readonly")
        || lower.contains("read only")
        || lower.contains("read-only")
        || lower.contains("not writable")
}
