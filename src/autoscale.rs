//! Auto-scaling object pool.
//!
//! [`AutoScalePool<F>`] wraps a bounded [`Pool<F>`] and adds batched
//! scale-out on miss, a background sweep that evicts idle entries down to
//! `min_size`, and TTL/stale refresh of resident entries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::entry::{Factory, Key, PoolEntry, StaleChecker, Status};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolConfig, PoolStats, run_close_hook};

/// Configuration for the auto-scale behavior layered on top of [`PoolConfig`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AutoScaleConfig {
    /// How often the background sweep runs.
    pub check_interval: Duration,
    /// Maximum age of an entry before it is refreshed.
    pub object_ttl: Duration,
    /// Idle duration after which an `Available` entry is scaled in.
    pub max_idle_time: Duration,
    /// Batch size for scale-out on a miss. `1` disables batch growth.
    pub scale_factor: usize,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            object_ttl: Duration::from_secs(3600),
            max_idle_time: Duration::from_secs(600),
            scale_factor: 1,
        }
    }
}

impl AutoScaleConfig {
    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::configuration("check_interval must be greater than zero"));
        }
        if self.object_ttl.is_zero() {
            return Err(Error::configuration("object_ttl must be greater than zero"));
        }
        if self.max_idle_time.is_zero() {
            return Err(Error::configuration("max_idle_time must be greater than zero"));
        }
        if self.scale_factor == 0 {
            return Err(Error::configuration("scale_factor must be >= 1"));
        }
        Ok(())
    }
}

struct AutoInner<F: Factory> {
    config: AutoScaleConfig,
    stale_checker: Option<StaleChecker<F::Object>>,
    scaling_out: AtomicBool,
    sweep_cancel: CancellationToken,
}

/// An auto-scaling object pool.
///
/// Cheap to clone — internally an `Arc` plus the underlying [`Pool`]'s own
/// `Arc`. Dropping every clone leaves the background sweep running until
/// [`AutoScalePool::close`] is called explicitly; callers are expected to
/// hold on to one handle for the pool's lifetime.
pub struct AutoScalePool<F: Factory> {
    pool: Pool<F>,
    inner: Arc<AutoInner<F>>,
}

impl<F: Factory> Clone for AutoScalePool<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Factory> std::fmt::Debug for AutoScalePool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScalePool")
            .field("stats", &self.stats())
            .field("config", &self.inner.config)
            .finish()
    }
}

enum ReleaseDecision<T> {
    ReturnAvailable(T),
    Refresh(T),
}

impl<F: Factory> AutoScalePool<F> {
    /// Create a new auto-scaling pool and start its background sweep.
    pub async fn new(factory: F, pool_config: PoolConfig, auto_config: AutoScaleConfig) -> Result<Self> {
        Self::build(factory, pool_config, auto_config, None).await
    }

    /// As [`AutoScalePool::new`], with a predicate that flags otherwise-fresh
    /// payloads as stale.
    pub async fn with_stale_checker<S>(
        factory: F,
        pool_config: PoolConfig,
        auto_config: AutoScaleConfig,
        stale_checker: S,
    ) -> Result<Self>
    where
        S: Fn(&F::Object) -> bool + Send + Sync + 'static,
    {
        Self::build(factory, pool_config, auto_config, Some(Box::new(stale_checker))).await
    }

    async fn build(
        factory: F,
        pool_config: PoolConfig,
        auto_config: AutoScaleConfig,
        stale_checker: Option<StaleChecker<F::Object>>,
    ) -> Result<Self> {
        auto_config.validate()?;
        let pool = Pool::new(factory, pool_config).await?;
        let inner = Arc::new(AutoInner {
            config: auto_config,
            stale_checker,
            scaling_out: AtomicBool::new(false),
            sweep_cancel: CancellationToken::new(),
        });
        let scaler = Self { pool, inner };
        scaler.spawn_sweep();
        Ok(scaler)
    }

    /// Acquire an entry, blocking until one is available or the pool closes.
    pub async fn acquire(&self) -> Result<PoolEntry<F::Object>> {
        let (raw_entry, created) = self.pool.acquire_tracked().await?;
        if created {
            self.maybe_scale_out();
        }
        Ok(self.rewrap(raw_entry))
    }

    /// As [`AutoScalePool::acquire`], but gives up after `timeout` with
    /// [`Error::Timeout`] instead of waiting indefinitely.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PoolEntry<F::Object>> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout { waited: timeout }),
        }
    }

    /// Acquire an entry without waiting; fails immediately if none is free.
    pub async fn try_acquire(&self) -> Result<PoolEntry<F::Object>> {
        let raw_entry = self.pool.try_acquire().await?;
        // A successful try_acquire only ever takes the fast queue path or
        // creates exactly the entry it returns, so scale-out is triggered
        // the same way a plain acquire miss would be: when size just grew.
        self.maybe_scale_out();
        Ok(self.rewrap(raw_entry))
    }

    /// Re-point a raw `Pool`-issued entry's drop callback at this pool's own
    /// release logic instead of the bounded pool's.
    fn rewrap(&self, raw_entry: PoolEntry<F::Object>) -> PoolEntry<F::Object> {
        let (key, object) = raw_entry.defuse();
        let me = self.clone();
        PoolEntry::new(
            key,
            self.pool.inner.id,
            object,
            Box::new(move |key, object| {
                me.do_release(key, object);
            }),
        )
    }

    fn maybe_scale_out(&self) {
        if self.inner.config.scale_factor <= 1 {
            return;
        }
        if self
            .inner
            .scaling_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // a batch is already in flight
        }
        let me = self.clone();
        tokio::spawn(async move {
            me.run_scale_out_batch().await;
            me.inner.scaling_out.store(false, Ordering::Release);
        });
    }

    async fn run_scale_out_batch(&self) {
        let to_create = self.inner.config.scale_factor - 1;
        for _ in 0..to_create {
            let permit = match self.pool.inner.semaphore.try_acquire() {
                Ok(permit) => permit,
                Err(_) => break, // at max_size already
            };
            permit.forget();
            match self.pool.inner.factory.create().await {
                Ok(object) => {
                    let key = self.pool.next_key();
                    self.pool
                        .inner
                        .entries
                        .insert(key, parking_lot::Mutex::new(crate::entry::Slot::new_available(object)));
                    self.pool.inner.available.push(key);
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "scale-out: factory failed, shrinking batch");
                    self.pool.inner.semaphore.add_permits(1);
                }
            }
        }
    }

    /// Release an entry back to the pool.
    ///
    /// Never blocks the caller on factory latency: a refresh (if one is
    /// owed) runs on a spawned task, and this call returns as soon as the
    /// decision of what to do is made.
    pub fn release(&self, entry: PoolEntry<F::Object>) -> Result<()> {
        if entry.pool_id != self.pool.inner.id {
            return Err(Error::misuse("entry does not belong to this pool"));
        }
        let (key, object) = entry.defuse();
        self.do_release(key, object);
        Ok(())
    }

    fn do_release(&self, key: Key, object: F::Object) {
        if self.pool.inner.closed.load(Ordering::Acquire) {
            self.pool.inner.entries.remove(&key);
            if let Some(hook) = &self.pool.inner.on_close {
                run_close_hook(hook, object);
            }
            return;
        }

        let decision = {
            let Some(slot_ref) = self.pool.inner.entries.get(&key) else {
                return; // removed concurrently (e.g. scaled in while acquired — shouldn't happen, but be safe)
            };
            let mut slot = slot_ref.lock();
            let now = Instant::now();
            if slot.status == Status::PendingRefresh {
                ReleaseDecision::Refresh(object)
            } else {
                slot.last_used = now;
                if self.needs_refresh(&object, slot.created_at) {
                    ReleaseDecision::Refresh(object)
                } else {
                    ReleaseDecision::ReturnAvailable(object)
                }
            }
        };

        match decision {
            ReleaseDecision::ReturnAvailable(object) => self.return_available(key, object),
            ReleaseDecision::Refresh(object) => {
                let me = self.clone();
                tokio::spawn(async move {
                    me.perform_refresh(key, object).await;
                });
            }
        }
    }

    fn return_available(&self, key: Key, object: F::Object) {
        if let Some(slot_ref) = self.pool.inner.entries.get(&key) {
            let mut slot = slot_ref.lock();
            slot.status = Status::Available;
            slot.object = Some(object);
            slot.last_used = Instant::now();
        }
        self.pool.inner.available.push(key);
        self.pool.inner.semaphore.add_permits(1);
    }

    fn needs_refresh(&self, object: &F::Object, created_at: Instant) -> bool {
        if created_at.elapsed() >= self.inner.config.object_ttl {
            return true;
        }
        let Some(checker) = &self.inner.stale_checker else {
            return false;
        };
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| checker(object))).unwrap_or_else(|_panic| {
            #[cfg(feature = "tracing")]
            tracing::warn!("stale_checker panicked, treating payload as not stale");
            false
        })
    }

    async fn perform_refresh(&self, key: Key, old_object: F::Object) {
        match self.pool.inner.factory.create().await {
            Ok(new_object) => {
                if let Some(hook) = &self.pool.inner.on_close {
                    run_close_hook(hook, old_object);
                }
                if let Some(slot_ref) = self.pool.inner.entries.get(&key) {
                    let mut slot = slot_ref.lock();
                    let now = Instant::now();
                    slot.status = Status::Available;
                    slot.object = Some(new_object);
                    slot.created_at = now;
                    slot.last_used = now;
                }
                self.pool.inner.available.push(key);
                self.pool.inner.semaphore.add_permits(1);
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "refresh: factory failed, reusing existing entry");
                let expired = self
                    .pool
                    .inner
                    .entries
                    .get(&key)
                    .is_some_and(|slot_ref| slot_ref.lock().created_at.elapsed() >= self.inner.config.object_ttl);
                if expired {
                    // the replacement also failed — scale it in rather than
                    // keep serving an entry already past its TTL.
                    self.pool.inner.entries.remove(&key);
                    if let Some(hook) = &self.pool.inner.on_close {
                        run_close_hook(hook, old_object);
                    }
                    self.pool.inner.semaphore.add_permits(1);
                } else {
                    self.return_available(key, old_object);
                }
            }
        }
    }

    fn spawn_sweep(&self) {
        let me = self.clone();
        let cancel = self.inner.sweep_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(me.inner.config.check_interval) => {}
                    () = cancel.cancelled() => break,
                }
                me.run_sweep().await;
            }
        });
    }

    async fn run_sweep(&self) {
        let keys: Vec<Key> = self.pool.inner.entries.iter().map(|e| *e.key()).collect();
        let min_size = self.pool.inner.config.min_size;

        for key in keys {
            let current_size = self.pool.size();
            let Some(slot_ref) = self.pool.inner.entries.get(&key) else {
                continue; // removed by a concurrent sweep step or acquire
            };

            enum SweepAction<T> {
                None,
                MarkPending,
                // The slot's status has already been flipped away from
                // `Available` (to `Closed`/`PendingRefresh`) under the same
                // lock that decided this, so a concurrent `claim()` cannot
                // pick the entry up in between.
                ScaleIn(T),
                Refresh(T),
            }

            let action = {
                let mut slot = slot_ref.lock();
                let now = Instant::now();
                match slot.status {
                    Status::Available => {
                        let idle_for = now.duration_since(slot.last_used);
                        if idle_for >= self.inner.config.max_idle_time && current_size > min_size {
                            slot.status = Status::Closed;
                            SweepAction::ScaleIn(slot.object.take().expect("available slot missing object"))
                        } else {
                            let needs_refresh = {
                                let object = slot.object.as_ref().expect("available slot missing object");
                                self.needs_refresh(object, slot.created_at)
                            };
                            if needs_refresh {
                                slot.status = Status::PendingRefresh;
                                SweepAction::Refresh(slot.object.take().expect("available slot missing object"))
                            } else {
                                SweepAction::None
                            }
                        }
                    }
                    Status::Acquired => {
                        // We cannot consult the payload (the caller holds
                        // it); TTL alone decides whether to flag it.
                        if now.duration_since(slot.created_at) >= self.inner.config.object_ttl {
                            slot.status = Status::PendingRefresh;
                            SweepAction::MarkPending
                        } else {
                            SweepAction::None
                        }
                    }
                    Status::PendingRefresh | Status::Initialized | Status::Closed => SweepAction::None,
                }
            };
            drop(slot_ref);

            match action {
                SweepAction::None | SweepAction::MarkPending => {}
                SweepAction::ScaleIn(object) => {
                    self.pool.inner.entries.remove(&key);
                    if let Some(hook) = &self.pool.inner.on_close {
                        run_close_hook(hook, object);
                    }
                    self.pool.inner.semaphore.add_permits(1);
                }
                SweepAction::Refresh(object) => {
                    self.refresh_available_entry(key, object).await;
                }
            }
        }
    }

    async fn refresh_available_entry(&self, key: Key, old_object: F::Object) {
        match self.pool.inner.factory.create().await {
            Ok(new_object) => {
                if let Some(hook) = &self.pool.inner.on_close {
                    run_close_hook(hook, old_object);
                }
                if let Some(slot_ref) = self.pool.inner.entries.get(&key) {
                    let mut slot = slot_ref.lock();
                    let now = Instant::now();
                    slot.object = Some(new_object);
                    slot.created_at = now;
                    slot.last_used = now;
                    slot.status = Status::Available;
                }
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "sweep refresh failed, keeping existing entry");
                if let Some(slot_ref) = self.pool.inner.entries.get(&key) {
                    let mut slot = slot_ref.lock();
                    slot.object = Some(old_object);
                    slot.status = Status::Available;
                }
            }
        }
    }

    /// Number of entries currently resident in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    /// The configured hard cap on resident entries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.pool.max_size()
    }

    /// Snapshot statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the pool and stop the background sweep. Idempotent.
    pub fn close(&self) {
        self.inner.sweep_cancel.cancel();
        self.pool.close();
    }
}
