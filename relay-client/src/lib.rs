//! # Relay Distributed Cache Client
//!
//! Purpose: Give every hot-path feature one resilient way to reach the shared
//! cache: an adaptive, lock-free connection pool and a retrying facade over
//! RESP2.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections; grow on demand, trim when idle.
//! 2. **Facade Pattern**: `ResilientCache` hides pooling, leasing, and retries
//!    behind `relay_common::CacheStore`.
//! 3. **Classify at the Boundary**: Backing-store failures become a
//!    retryable/fatal decision once, where they are raised.
//! 4. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//!
//! ## Flow
//!
//! ```text
//! facade op ─▶ Governor::rent ─▶ ConnectionScope ─▶ command
//!                                     │ failure: classify ─▶ retry or raise
//!                                     ▼
//!                               release / dispose   (maintenance rebalances)
//! ```

mod connection;
mod facade;
mod governor;
mod metrics;
mod resp;
mod scope;

#[cfg(test)]
mod testing;

pub use connection::{
    is_write_command, parse_role, CacheConnection, Connector, Endpoint, EndpointRole,
    TcpConnection, TcpConnector,
};
pub use facade::ResilientCache;
pub use governor::{Governor, MaintenanceReport, PoolStats};
pub use metrics::{AttemptOutcome, AttemptTimer, CacheMetrics, LatencySnapshot, MetricsSnapshot};
pub use resp::{encode_command, read_response, RespValue};
pub use scope::{ConnectionScope, Database, ScanPage, Server};
