//! # Pool Probe
//!
//! Purpose: Drive a live cache through the resilient facade with concurrent
//! bursts and print how the pool and the retry loop responded, so operators
//! can check sizing and failover behavior against a real deployment.
//!
//! Usage: `relay-probe [addr] [burst] [rounds]`, logging via `RUST_LOG`.

use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use tracing_subscriber::EnvFilter;

use relay_client::ResilientCache;
use relay_common::{CacheSettings, CacheStore};

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_BURST: usize = 64;
const DEFAULT_ROUNDS: usize = 5;
const PROBE_CONNECTION: &str = "probe";

struct ProbeConfig {
    addr: String,
    burst: usize,
    rounds: usize,
}

impl ProbeConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        ProbeConfig {
            addr: args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            burst: parse_usize(args.next(), DEFAULT_BURST),
            rounds: parse_usize(args.next(), DEFAULT_ROUNDS),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = ProbeConfig::from_args();
    let settings = CacheSettings {
        connection_strings: HashMap::from([(PROBE_CONNECTION.to_string(), config.addr.clone())]),
        ..CacheSettings::default()
    };

    let cache = ResilientCache::connect(&settings, PROBE_CONNECTION)
        .await
        .with_context(|| format!("connecting to {}", config.addr))?;

    println!(
        "probe addr={} burst={} rounds={}",
        config.addr, config.burst, config.rounds
    );

    for round in 0..config.rounds {
        let started = Instant::now();
        let tasks: Vec<_> = (0..config.burst)
            .map(|idx| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let key = format!("relay-probe:{}:{}", round, idx);
                    cache
                        .string_set(&key, "ok", Some(Duration::from_secs(30)))
                        .await?;
                    cache.string_get(&key).await
                })
            })
            .collect();

        let mut failures = 0usize;
        for task in tasks {
            match task.await.context("probe task panicked")? {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => failures += 1,
            }
        }

        let pool = cache.governor().stats();
        let metrics = cache.metrics().snapshot();
        println!(
            "round={} elapsed_ms={} failures={} allocated={} idle={} taken={} target={} scale_ups={} attempts={} retries={}",
            round,
            started.elapsed().as_millis(),
            failures,
            pool.allocated,
            pool.idle,
            pool.taken,
            pool.target_size,
            pool.scale_ups,
            metrics.attempts_total,
            metrics.retries_total,
        );
    }

    let scanned = cache
        .scan_keys("relay-probe:*")
        .try_fold(0usize, |count, _| async move { Ok(count + 1) })
        .await?;
    println!("scan matched {} probe keys", scanned);

    cache.shutdown().await;
    Ok(())
}
