//! Bounded object pool — the engine every other layer in this crate builds on.
//!
//! `Pool<F>` lazily manufactures up to `max_size` objects via `F::create`,
//! hands them out to acquirers, and takes them back on release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::entry::{CloseHook, Factory, Key, PoolEntry, Slot, Status};
use crate::error::{Error, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Configuration shared by both pool variants.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfig {
    /// Prewarm count and (for the auto-scale variant) the scale-in floor.
    pub min_size: usize,
    /// Hard cap on resident entries.
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
        }
    }
}

impl PoolConfig {
    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Entries currently checked out.
    pub acquired: usize,
    /// Entries sitting in the available queue.
    pub available: usize,
    /// Total entries resident in the table (`acquired + available`, modulo
    /// entries mid-transition).
    pub size: usize,
}

/// Shared state behind every `Pool<F>` clone.
pub(crate) struct PoolInner<F: Factory> {
    pub(crate) id: u64,
    pub(crate) factory: F,
    pub(crate) on_close: Option<CloseHook<F::Object>>,
    pub(crate) entries: DashMap<Key, Mutex<Slot<F::Object>>>,
    pub(crate) available: SegQueue<Key>,
    pub(crate) semaphore: Semaphore,
    pub(crate) next_key: AtomicU64,
    pub(crate) config: PoolConfig,
    pub(crate) closed: AtomicBool,
}

/// A bounded pool of `F::Object` instances.
///
/// Cheap to clone — internally an `Arc`. All methods are safe to call from
/// multiple tasks concurrently.
pub struct Pool<F: Factory> {
    pub(crate) inner: Arc<PoolInner<F>>,
}

impl<F: Factory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Factory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("stats", &self.stats()).finish()
    }
}

impl<F: Factory> Pool<F> {
    /// Create a new pool, eagerly prewarming `config.min_size` entries.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `config` is invalid. Prewarm
    /// failures from the factory are logged and otherwise ignored — a pool
    /// that cannot prewarm can still serve lazy `acquire` calls.
    pub async fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "tracing")]
        tracing::debug!(min_size = config.min_size, max_size = config.max_size, "creating pool");

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            on_close: None,
            entries: DashMap::new(),
            available: SegQueue::new(),
            semaphore: Semaphore::new(config.max_size),
            next_key: AtomicU64::new(0),
            config,
            closed: AtomicBool::new(false),
        });
        let pool = Self { inner };
        pool.prewarm().await;
        Ok(pool)
    }

    /// As [`Pool::new`], but with a close hook invoked on every permanently
    /// removed entry.
    pub async fn with_close_hook<H>(factory: F, config: PoolConfig, on_close: H) -> Result<Self>
    where
        H: Fn(F::Object) + Send + Sync + 'static,
    {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            on_close: Some(Box::new(on_close)),
            entries: DashMap::new(),
            available: SegQueue::new(),
            semaphore: Semaphore::new(config.max_size),
            next_key: AtomicU64::new(0),
            config,
            closed: AtomicBool::new(false),
        });
        let pool = Self { inner };
        pool.prewarm().await;
        Ok(pool)
    }

    async fn prewarm(&self) {
        for _ in 0..self.inner.config.min_size {
            match self.inner.factory.create().await {
                Ok(object) => {
                    let key = self.next_key();
                    self.inner.entries.insert(key, Mutex::new(Slot::new_available(object)));
                    self.inner.available.push(key);
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "prewarm: factory failed, continuing with a smaller pool");
                    break;
                }
            }
        }
    }

    pub(crate) fn next_key(&self) -> Key {
        self.inner.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquire an entry, blocking until one is available or the pool closes.
    pub async fn acquire(&self) -> Result<PoolEntry<F::Object>> {
        let (entry, _created) = self.acquire_tracked().await?;
        Ok(entry)
    }

    /// As [`Pool::acquire`], but gives up after `timeout` with
    /// [`Error::Timeout`] instead of waiting indefinitely.
    pub async fn acquire_timeout(&self, timeout: std::time::Duration) -> Result<PoolEntry<F::Object>> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout { waited: timeout }),
        }
    }

    /// Like [`Pool::acquire`], but also reports whether this call created a
    /// brand-new entry (a "miss") — used by the auto-scale layer to decide
    /// whether to trigger a scale-out batch.
    pub(crate) async fn acquire_tracked(&self) -> Result<(PoolEntry<F::Object>, bool)> {
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_closed| Error::Closed)?;
        permit.forget();
        self.claim_or_create().await
    }

    /// Acquire an entry without waiting on the semaphore; fails immediately
    /// if the pool is saturated. Otherwise behaves exactly like `acquire`
    /// from the point a permit is held, including lazily creating an entry.
    pub async fn try_acquire(&self) -> Result<PoolEntry<F::Object>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match self.inner.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                let (entry, _created) = self.claim_or_create().await?;
                Ok(entry)
            }
            Err(_) => Err(Error::PoolExhausted {
                current_size: self.size(),
                max_size: self.inner.config.max_size,
            }),
        }
    }

    /// Pop an available key and claim it, or create a new entry. Assumes a
    /// permit has already been reserved by the caller.
    async fn claim_or_create(&self) -> Result<(PoolEntry<F::Object>, bool)> {
        loop {
            if let Some(key) = self.inner.available.pop() {
                if let Some(object) = self.claim(key) {
                    return Ok((self.wrap(key, object), false));
                }
                // Entry vanished (closed concurrently) — retry with the
                // permit we already hold.
                continue;
            }

            let key = self.next_key();
            match self.inner.factory.create().await {
                Ok(object) => {
                    self.inner.entries.insert(key, Mutex::new(Slot::new_acquired()));
                    #[cfg(feature = "tracing")]
                    tracing::debug!(key, "lazily created pool entry");
                    return Ok((self.wrap(key, object), true));
                }
                Err(err) => {
                    self.inner.semaphore.add_permits(1);
                    return Err(err);
                }
            }
        }
    }

    /// Transition an `Available` entry to `Acquired` and take its payload.
    fn claim(&self, key: Key) -> Option<F::Object> {
        let slot_ref = self.inner.entries.get(&key)?;
        let mut slot = slot_ref.lock();
        if slot.status != Status::Available {
            return None;
        }
        slot.status = Status::Acquired;
        slot.last_used = std::time::Instant::now();
        slot.object.take()
    }

    fn wrap(&self, key: Key, object: F::Object) -> PoolEntry<F::Object> {
        let pool = self.clone();
        PoolEntry::new(
            key,
            self.inner.id,
            object,
            Box::new(move |key, object| {
                if let Err(_err) = pool.do_release(key, object) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "drop-release failed");
                }
            }),
        )
    }

    /// Return an entry to the pool.
    ///
    /// # Errors
    /// Returns [`Error::Misuse`] if `entry` belongs to a different pool —
    /// in that case the entry is returned untouched (its own `Drop` still
    /// routes it back to its real owner).
    pub fn release(&self, entry: PoolEntry<F::Object>) -> Result<()> {
        if entry.pool_id != self.inner.id {
            return Err(Error::misuse("entry does not belong to this pool"));
        }
        let (key, object) = entry.defuse();
        self.do_release(key, object)
    }

    pub(crate) fn do_release(&self, key: Key, object: F::Object) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.entries.remove(&key);
            if let Some(hook) = &self.inner.on_close {
                run_close_hook(hook, object);
            }
            return Ok(());
        }

        if let Some(slot_ref) = self.inner.entries.get(&key) {
            let mut slot = slot_ref.lock();
            slot.status = Status::Available;
            slot.object = Some(object);
            slot.last_used = std::time::Instant::now();
        }
        self.inner.available.push(key);
        self.inner.semaphore.add_permits(1);
        Ok(())
    }

    /// Number of entries currently resident in the pool (acquired + idle).
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.entries.len()
    }

    /// The configured hard cap on resident entries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Snapshot statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let size = self.size();
        let available = self.inner.available.len();
        PoolStats {
            acquired: size.saturating_sub(available),
            available,
            size,
        }
    }

    /// Close the pool. Idempotent.
    ///
    /// Subsequent `acquire`/`try_acquire` calls fail with [`Error::Closed`].
    /// Every currently-idle entry is removed and passed to the close hook;
    /// entries still checked out are closed as they are released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return; // already closed
        }
        self.inner.semaphore.close();

        let idle_keys: Vec<Key> = {
            let mut keys = Vec::new();
            while let Some(key) = self.inner.available.pop() {
                keys.push(key);
            }
            keys
        };

        for key in idle_keys {
            if let Some((_, slot)) = self.inner.entries.remove(&key) {
                let mut slot = slot.into_inner();
                if let (Some(object), Some(hook)) = (slot.object.take(), &self.inner.on_close) {
                    run_close_hook(hook, object);
                }
            }
        }
    }
}

pub(crate) fn run_close_hook<T>(hook: &CloseHook<T>, object: T) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(object)));
    if let Err(_panic) = result {
        #[cfg(feature = "tracing")]
        tracing::warn!("close hook panicked");
    }
}
