//! # Resilient Cache Facade
//!
//! Purpose: The process-facing `CacheStore` for the distributed backend. Each
//! operation rents a connection, runs one command, and releases the lease;
//! read-only failures seen during a failover are retried on a fresh
//! connection for a bounded window before surfacing.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: Callers see `CacheStore`, never the pool or leases.
//! 2. **One Deadline**: The retry budget is fixed when the operation starts.
//! 3. **Errors Pass Through**: A surfaced failure is the original error.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::time::Instant;

use relay_common::{
    classify, CacheResult, CacheSettings, CacheStore, FailureClass, KeyStream, RetryOptions,
};

use crate::connection::{Connector, TcpConnector};
use crate::governor::Governor;
use crate::metrics::{AttemptOutcome, CacheMetrics};
use crate::scope::ConnectionScope;

/// Keys requested per `SCAN` step.
const SCAN_PAGE_SIZE: usize = 250;

/// `CacheStore` over a pooled, retrying connection set.
pub struct ResilientCache<C: Connector = TcpConnector> {
    governor: Governor<C>,
    retry: RetryOptions,
    metrics: Arc<CacheMetrics>,
}

impl<C: Connector> Clone for ResilientCache<C> {
    fn clone(&self) -> Self {
        ResilientCache {
            governor: self.governor.clone(),
            retry: self.retry.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl ResilientCache<TcpConnector> {
    /// Resolves `name` in `settings` and starts a pool against it.
    pub async fn connect(settings: &CacheSettings, name: &str) -> CacheResult<Self> {
        let address = settings.resolve(name)?;
        let connector = TcpConnector::new(address, &settings.pool)?;
        let governor = Governor::start(connector, settings.pool.clone()).await?;
        tracing::info!(connection = name, address, "distributed cache ready");
        Ok(Self::new(governor, settings.retry.clone()))
    }
}

impl<C: Connector> ResilientCache<C> {
    pub fn new(governor: Governor<C>, retry: RetryOptions) -> Self {
        ResilientCache {
            governor,
            retry,
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    pub fn governor(&self) -> &Governor<C> {
        &self.governor
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Stops the pool's maintenance loop and closes idle connections.
    pub async fn shutdown(&self) {
        self.governor.shutdown().await;
    }

    /// Runs `op` on a leased connection, retrying retryable failures on a
    /// fresh lease until the retry budget, measured from the first attempt,
    /// runs out. Fatal failures surface immediately.
    pub async fn exec_with_retry<T, F>(&self, operation: &'static str, mut op: F) -> CacheResult<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut ConnectionScope<C>) -> BoxFuture<'s, CacheResult<T>> + Send,
    {
        let deadline = Instant::now() + self.retry.budget;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            // Ends the attempt even if this future is dropped mid-command.
            let timer = self.metrics.start_attempt();

            let mut scope = match self.governor.rent().await {
                Ok(scope) => scope,
                Err(err) => {
                    timer.finish(AttemptOutcome::Fatal);
                    return Err(err);
                }
            };

            let err = match op(&mut scope).await {
                Ok(value) => {
                    scope.release().await;
                    timer.finish(AttemptOutcome::Success);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classify(&err);
            if class == FailureClass::Retryable {
                scope.mark_faulted();
            }
            scope.release().await;

            let outcome = match class {
                FailureClass::Retryable => AttemptOutcome::Retryable,
                FailureClass::Fatal => AttemptOutcome::Fatal,
            };
            timer.finish(outcome);

            if class == FailureClass::Fatal {
                return Err(err);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    error = %err,
                    "cache retry budget exhausted"
                );
                return Err(err);
            }

            tracing::debug!(operation, attempt, error = %err, "retrying cache command");
            self.metrics.record_retry();
            tokio::time::sleep(self.retry.delay).await;
        }
    }
}

struct ScanState<C: Connector> {
    cache: ResilientCache<C>,
    pattern: String,
    /// `None` once the server reports the scan complete.
    cursor: Option<u64>,
    buffer: VecDeque<String>,
    // SCAN may return a key more than once within one iteration.
    seen: HashSet<String>,
}

#[async_trait]
impl<C: Connector> CacheStore for ResilientCache<C> {
    async fn string_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.exec_with_retry("string_set", move |scope| {
            let (key, value) = (key.clone(), value.clone());
            async move { scope.database().set(&key, &value, ttl).await }.boxed()
        })
        .await
    }

    async fn string_get(&self, key: &str) -> CacheResult<Option<String>> {
        let key = key.to_owned();
        self.exec_with_retry("string_get", move |scope| {
            let key = key.clone();
            async move { scope.database().get(&key).await }.boxed()
        })
        .await
    }

    async fn update_expiration(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let key = key.to_owned();
        self.exec_with_retry("update_expiration", move |scope| {
            let key = key.clone();
            async move { scope.database().expire(&key, ttl).await }.boxed()
        })
        .await
    }

    async fn key_delete(&self, key: &str) -> CacheResult<bool> {
        let key = key.to_owned();
        self.exec_with_retry("key_delete", move |scope| {
            let key = key.clone();
            async move { scope.database().delete(&key).await }.boxed()
        })
        .await
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        let key = key.to_owned();
        self.exec_with_retry("key_exists", move |scope| {
            let key = key.clone();
            async move { scope.database().exists(&key).await }.boxed()
        })
        .await
    }

    async fn string_increment(&self, key: &str, by: i64) -> CacheResult<i64> {
        let key = key.to_owned();
        self.exec_with_retry("string_increment", move |scope| {
            let key = key.clone();
            async move { scope.database().increment(&key, by).await }.boxed()
        })
        .await
    }

    fn scan_keys(&self, pattern: &str) -> KeyStream {
        let state = ScanState {
            cache: self.clone(),
            pattern: pattern.to_owned(),
            cursor: Some(0),
            buffer: VecDeque::new(),
            seen: HashSet::new(),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(key) = state.buffer.pop_front() {
                    return Some((Ok(key), state));
                }
                let cursor = state.cursor?;

                let pattern = escape_match_pattern(&state.pattern);
                let page = state
                    .cache
                    .exec_with_retry("scan_keys", move |scope| {
                        let pattern = pattern.clone();
                        async move {
                            scope
                                .server()
                                .scan_page(cursor, &pattern, SCAN_PAGE_SIZE)
                                .await
                        }
                        .boxed()
                    })
                    .await;

                match page {
                    Ok(page) => {
                        state.cursor = (page.cursor != 0).then_some(page.cursor);
                        for key in page.keys {
                            if state.seen.insert(key.clone()) {
                                state.buffer.push_back(key);
                            }
                        }
                    }
                    Err(err) => {
                        state.cursor = None;
                        return Some((Err(err), state));
                    }
                }
            }
        })
        .boxed()
    }
}

/// Escapes the characters Redis `MATCH` treats as special beyond `*` and
/// `?`, so both backends agree on what a pattern means.
fn escape_match_pattern(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if matches!(ch, '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
