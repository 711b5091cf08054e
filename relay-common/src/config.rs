//! # Pool and Retry Configuration
//!
//! Purpose: Describe the knobs the connection pool and the retry loop read at
//! startup. Loading is left to the process; these types only parse and check.
//!
//! ## Usage
//!
//! ```
//! use relay_common::CacheSettings;
//!
//! let settings = CacheSettings::from_json_str(
//!     r#"{ "connection_strings": { "presence": "127.0.0.1:6379" },
//!          "pool": { "target_size": 32 } }"#,
//! ).unwrap();
//! assert_eq!(settings.resolve("presence").unwrap(), "127.0.0.1:6379");
//! assert_eq!(settings.pool.target_size, 32);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Advisory pool size driving pre-warm, trimming, and scale decisions.
    pub target_size: usize,
    /// Absolute ceiling auto-scale never grows `target_size` past.
    pub max_target_size: usize,
    /// Period of the background maintenance pass.
    #[serde(rename = "maintenance_interval_ms", with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// Minimum time between two automatic increases of `target_size`.
    #[serde(rename = "scale_cooldown_ms", with = "duration_ms")]
    pub scale_cooldown: Duration,
    /// Over-target rents observed before a scale-up is attempted.
    pub overuse_threshold: usize,
    /// Optional TCP connect timeout.
    #[serde(rename = "connect_timeout_ms", with = "opt_duration_ms")]
    pub connect_timeout: Option<Duration>,
    /// Optional per-command read timeout.
    #[serde(rename = "read_timeout_ms", with = "opt_duration_ms")]
    pub read_timeout: Option<Duration>,
    /// Optional per-command write timeout.
    #[serde(rename = "write_timeout_ms", with = "opt_duration_ms")]
    pub write_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            target_size: 16,
            max_target_size: 2000,
            maintenance_interval: Duration::from_secs(120),
            scale_cooldown: Duration::from_secs(60),
            overuse_threshold: 5,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl PoolOptions {
    /// Rejects option combinations the governor cannot run with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.target_size == 0 {
            return Err(CacheError::InvalidConfig("target_size must be positive"));
        }
        if self.max_target_size < self.target_size {
            return Err(CacheError::InvalidConfig(
                "max_target_size cannot be below target_size",
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "maintenance_interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Bounds for the facade's retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Wall-clock window, measured from the first attempt, in which
    /// retryable failures are retried.
    #[serde(rename = "budget_ms", with = "duration_ms")]
    pub budget: Duration,
    /// Pause between attempts.
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            budget: Duration::from_millis(500),
            delay: Duration::from_millis(5),
        }
    }
}

/// Which facade implementation the composition root wires in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Shared external cache reached through the connection pool.
    #[default]
    Clustered,
    /// Single process, in-memory fallback.
    SingleInstance,
}

/// Cache section of the process configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub mode: DeploymentMode,
    /// Logical name -> `host:port`.
    pub connection_strings: HashMap<String, String>,
    pub pool: PoolOptions,
    pub retry: RetryOptions,
}

impl CacheSettings {
    /// Parses a JSON settings document and validates the pool options.
    pub fn from_json_str(raw: &str) -> CacheResult<Self> {
        let settings: CacheSettings = serde_json::from_str(raw)?;
        settings.pool.validate()?;
        Ok(settings)
    }

    /// Resolves a logical connection name to its address.
    pub fn resolve(&self, name: &str) -> CacheResult<&str> {
        self.connection_strings
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| CacheError::UnknownConnection {
                name: name.to_string(),
            })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
