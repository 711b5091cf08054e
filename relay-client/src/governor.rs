//! # Pool Governor
//!
//! Purpose: Own every connection to the backing store, lease them out through
//! `ConnectionScope`, and keep the pool sized to demand.
//!
//! ## Design Principles
//! 1. **Elastic, Never Rejecting**: `rent` allocates past `target_size`; the
//!    target is an advisory signal for scaling and trimming, not a cap.
//! 2. **Lock-Free Hot Path**: The idle set is a `SegQueue` and every counter is
//!    an atomic. Combined reads may be slightly stale; nothing depends on them
//!    being exact.
//! 3. **Grow Fast, Shrink Lazily**: Overuse raises `target_size` in tiered steps
//!    once per cooldown; only the maintenance pass trims, and only idle excess.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!  Idle ──rent──▶ Leased ──healthy return──▶ Idle
//!                   │
//!                   └──unhealthy return / faulted──▶ Disposed
//!  Idle ──maintenance trims excess──▶ Disposed
//! ```
//!
//! ## Counter Discipline
//!
//! A slot is added to `allocated` before its lease is added to `taken`, and
//! removed from `taken` before it leaves `allocated`, so `taken <= allocated`
//! holds whenever the pool is quiescent.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_common::{CacheError, CacheResult, PoolOptions};

use crate::connection::{CacheConnection, Connector};
use crate::scope::ConnectionScope;

/// Point-in-time view of the pool, polled by metrics reporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, idle and leased.
    pub allocated: usize,
    pub taken: usize,
    /// Connections sitting in the idle set.
    pub idle: usize,
    pub target_size: usize,
    pub overuse_counter: usize,
    /// Automatic increases of `target_size` since start.
    pub scale_ups: usize,
}

/// Work done by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Connections released without an await and closed now.
    pub retired_closed: usize,
    /// Idle connections disposed because the pool exceeded `target_size`.
    pub trimmed: usize,
}

struct GovernorInner<C: Connector> {
    connector: C,
    options: PoolOptions,
    idle: SegQueue<C::Connection>,
    /// Connections awaiting an asynchronous close; already out of `allocated`.
    retired: SegQueue<C::Connection>,
    allocated: AtomicUsize,
    taken: AtomicUsize,
    target_size: AtomicUsize,
    overuse_counter: AtomicUsize,
    scale_ups: AtomicUsize,
    /// Milliseconds since `epoch` of the last scale-up, plus one; zero means never.
    last_scale_up: AtomicU64,
    epoch: Instant,
    ceiling_warned: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Adaptive connection pool for one logical cache backend.
///
/// Cloning is cheap and shares the same pool.
pub struct Governor<C: Connector> {
    inner: Arc<GovernorInner<C>>,
}

impl<C: Connector> Clone for Governor<C> {
    fn clone(&self) -> Self {
        Governor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Governor<C> {
    /// Builds the pool, pre-warms half of `target_size`, and starts the
    /// maintenance loop. Must be called from within a tokio runtime.
    pub async fn start(connector: C, options: PoolOptions) -> CacheResult<Self> {
        let governor = Self::new(connector, options)?;
        let warm = governor.inner.options.target_size / 2;
        governor.prewarm(warm).await?;

        let handle = governor.spawn_maintenance();
        *governor.inner.maintenance.lock() = Some(handle);

        tracing::info!(
            target_size = governor.inner.options.target_size,
            max_target_size = governor.inner.options.max_target_size,
            prewarmed = warm,
            "cache connection pool started"
        );
        Ok(governor)
    }

    /// Builds an empty pool without a maintenance loop.
    ///
    /// Call `maintain` yourself or use `start`.
    pub fn new(connector: C, options: PoolOptions) -> CacheResult<Self> {
        options.validate()?;
        let target = options.target_size;
        Ok(Governor {
            inner: Arc::new(GovernorInner {
                connector,
                options,
                idle: SegQueue::new(),
                retired: SegQueue::new(),
                allocated: AtomicUsize::new(0),
                taken: AtomicUsize::new(0),
                target_size: AtomicUsize::new(target),
                overuse_counter: AtomicUsize::new(0),
                scale_ups: AtomicUsize::new(0),
                last_scale_up: AtomicU64::new(0),
                epoch: Instant::now(),
                ceiling_warned: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                maintenance: Mutex::new(None),
            }),
        })
    }

    /// Opens `count` connections straight into the idle set.
    pub async fn prewarm(&self, count: usize) -> CacheResult<()> {
        for _ in 0..count {
            let conn = self.allocate().await?;
            self.inner.idle.push(conn);
        }
        Ok(())
    }

    /// Leases a connection.
    ///
    /// Never fails because the pool is "full"; only a failed connect of a
    /// fresh connection, or a pool that is shutting down, returns an error.
    ///
    /// **Input**: none.
    /// **Output**: a `ConnectionScope` owning the lease, or the connect error.
    ///
    /// **Logic**:
    /// 1. Pop an idle connection; with none idle, reserve a new slot.
    /// 2. Count the lease and feed the overuse detector.
    /// 3. Replace a popped connection that fails validation.
    /// 4. On connect failure, roll both counters back.
    pub async fn rent(&self) -> CacheResult<ConnectionScope<C>> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(CacheError::ShuttingDown);
        }

        let popped = inner.idle.pop();
        if popped.is_none() {
            // Reserve the slot before the lease so `taken <= allocated`.
            inner.allocated.fetch_add(1, Ordering::SeqCst);
        }
        inner.taken.fetch_add(1, Ordering::SeqCst);
        self.note_demand();

        let conn = match popped {
            Some(conn) if self.validate(&conn) => Ok(conn),
            Some(stale) => {
                tracing::debug!("discarding unusable idle connection");
                // The stale connection's slot is handed to its replacement.
                stale.close().await;
                self.connect_reserved().await
            }
            None => self.connect_reserved().await,
        };

        match conn {
            Ok(conn) => Ok(ConnectionScope::new(self.clone(), conn)),
            Err(err) => {
                inner.taken.fetch_sub(1, Ordering::SeqCst);
                inner.allocated.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(error = %err, "failed to open cache connection");
                Err(err)
            }
        }
    }

    /// Usable iff connected and no known endpoint is serving as a replica.
    pub fn validate(&self, conn: &C::Connection) -> bool {
        conn.is_connected() && conn.endpoints().iter().all(|endpoint| endpoint.is_writable())
    }

    /// Healthy release: recycle if still valid, otherwise dispose.
    pub(crate) async fn return_connection(&self, conn: C::Connection) {
        let inner = &self.inner;
        inner.taken.fetch_sub(1, Ordering::SeqCst);
        if inner.shutting_down.load(Ordering::Acquire) || !self.validate(&conn) {
            inner.allocated.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("disposing connection on return");
            conn.close().await;
            return;
        }
        inner.idle.push(conn);
    }

    /// Faulted release: the caller saw a failure, so skip validation.
    pub(crate) async fn return_faulted(&self, conn: C::Connection) {
        let inner = &self.inner;
        inner.taken.fetch_sub(1, Ordering::SeqCst);
        inner.allocated.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("disposing faulted connection");
        conn.close().await;
    }

    /// Release without awaiting: recycle a healthy connection, queue the rest
    /// for the maintenance pass to close.
    pub(crate) fn return_detached(&self, conn: C::Connection, faulted: bool) {
        let inner = &self.inner;
        inner.taken.fetch_sub(1, Ordering::SeqCst);
        let shutting_down = inner.shutting_down.load(Ordering::Acquire);
        if !faulted && !shutting_down && self.validate(&conn) {
            inner.idle.push(conn);
            return;
        }

        inner.allocated.fetch_sub(1, Ordering::SeqCst);
        if shutting_down {
            // No maintenance pass will run again; dropping closes the socket.
            drop(conn);
        } else {
            inner.retired.push(conn);
        }
    }

    /// One maintenance pass. Leased connections are never touched.
    ///
    /// **Input**: none.
    /// **Output**: `MaintenanceReport` with what was closed.
    ///
    /// **Logic**:
    /// 1. Close everything on the retired queue.
    /// 2. Compute idle excess as `allocated - taken - target_size`.
    /// 3. Pop and close up to that many idle connections.
    pub async fn maintain(&self) -> MaintenanceReport {
        let inner = &self.inner;
        let mut report = MaintenanceReport::default();

        while let Some(conn) = inner.retired.pop() {
            conn.close().await;
            report.retired_closed += 1;
        }

        let taken = inner.taken.load(Ordering::SeqCst);
        let allocated = inner.allocated.load(Ordering::SeqCst);
        let target = inner.target_size.load(Ordering::Acquire);
        let mut excess = allocated.saturating_sub(taken).saturating_sub(target);

        while excess > 0 {
            let Some(conn) = inner.idle.pop() else { break };
            inner.allocated.fetch_sub(1, Ordering::SeqCst);
            conn.close().await;
            report.trimmed += 1;
            excess -= 1;
        }

        if report.trimmed > 0 || report.retired_closed > 0 {
            tracing::debug!(
                trimmed = report.trimmed,
                retired_closed = report.retired_closed,
                allocated = inner.allocated.load(Ordering::Relaxed),
                target_size = target,
                "cache pool maintenance"
            );
        }
        report
    }

    /// Raises `target_size` by a tiered step, at most once per cooldown and
    /// never past `max_target_size`. Returns true when the target grew.
    ///
    /// **Logic**:
    /// 1. Bail out inside the cooldown window.
    /// 2. At the ceiling, warn once and bail out.
    /// 3. Claim the window with a CAS so concurrent callers grow once.
    /// 4. Add `scale_step(current)`, clamped to the ceiling.
    pub fn try_increase_max_size(&self) -> bool {
        let inner = &self.inner;
        let now_ms = Instant::now()
            .saturating_duration_since(inner.epoch)
            .as_millis() as u64
            + 1;
        let cooldown_ms = inner.options.scale_cooldown.as_millis() as u64;

        let last = inner.last_scale_up.load(Ordering::Acquire);
        if last != 0 && now_ms.saturating_sub(last) < cooldown_ms {
            return false;
        }

        let current = inner.target_size.load(Ordering::Acquire);
        let ceiling = inner.options.max_target_size;
        if current >= ceiling {
            if !inner.ceiling_warned.swap(true, Ordering::AcqRel) {
                tracing::warn!(
                    target_size = current,
                    max_target_size = ceiling,
                    "cache pool is at its size ceiling under sustained overuse; add capacity upstream"
                );
            }
            return false;
        }

        // Claim this cooldown window; a concurrent caller that loses simply skips.
        if inner
            .last_scale_up
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let next = current.saturating_add(scale_step(current)).min(ceiling);
        inner.target_size.fetch_max(next, Ordering::AcqRel);
        inner.scale_ups.fetch_add(1, Ordering::Relaxed);
        if next == ceiling {
            tracing::warn!(
                target_size = next,
                max_target_size = ceiling,
                "cache pool target size reached its ceiling"
            );
        } else {
            tracing::info!(from = current, to = next, "increased cache pool target size");
        }
        true
    }

    /// Stops maintenance and closes every idle connection.
    ///
    /// Leased connections stay with their callers and are closed when their
    /// scopes release them.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancel.cancel();
        let handle = inner.maintenance.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut closed = 0usize;
        while let Some(conn) = inner.retired.pop() {
            conn.close().await;
            closed += 1;
        }
        while let Some(conn) = inner.idle.pop() {
            inner.allocated.fetch_sub(1, Ordering::SeqCst);
            conn.close().await;
            closed += 1;
        }

        tracing::info!(
            closed,
            still_leased = inner.taken.load(Ordering::Relaxed),
            "cache connection pool shut down"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            allocated: inner.allocated.load(Ordering::SeqCst),
            taken: inner.taken.load(Ordering::SeqCst),
            idle: inner.idle.len(),
            target_size: inner.target_size.load(Ordering::Relaxed),
            overuse_counter: inner.overuse_counter.load(Ordering::Relaxed),
            scale_ups: inner.scale_ups.load(Ordering::Relaxed),
        }
    }

    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    pub fn taken(&self) -> usize {
        self.inner.taken.load(Ordering::SeqCst)
    }

    pub fn target_size(&self) -> usize {
        self.inner.target_size.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Counts rents made while the pool is above target and triggers a
    /// scale-up every `overuse_threshold` of them.
    fn note_demand(&self) {
        let inner = &self.inner;
        let allocated = inner.allocated.load(Ordering::Relaxed);
        if allocated <= inner.target_size.load(Ordering::Relaxed) {
            return;
        }
        let seen = inner.overuse_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if seen >= inner.options.overuse_threshold {
            inner.overuse_counter.store(0, Ordering::Release);
            self.try_increase_max_size();
        }
    }

    /// Opens a connection and counts it in `allocated`.
    async fn allocate(&self) -> CacheResult<C::Connection> {
        self.inner.allocated.fetch_add(1, Ordering::SeqCst);
        match self.connect_reserved().await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.inner.allocated.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Opens a connection for a slot already counted in `allocated`.
    async fn connect_reserved(&self) -> CacheResult<C::Connection> {
        let conn = self.inner.connector.connect().await?;
        tracing::debug!(
            allocated = self.inner.allocated.load(Ordering::Relaxed),
            "allocated cache connection"
        );
        Ok(conn)
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak: Weak<GovernorInner<C>> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let interval = self.inner.options.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                // The loop must not keep a dropped pool alive.
                let Some(inner) = weak.upgrade() else { break };
                Governor { inner }.maintain().await;
            }
        })
    }
}

impl<C: Connector> Drop for GovernorInner<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Growth step for the current target: small pools grow gently, large pools
/// in bigger strides.
fn scale_step(current: usize) -> usize {
    match current {
        0..=63 => 4,
        64..=255 => 16,
        256..=1023 => 64,
        _ => 128,
    }
}
