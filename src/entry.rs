//! The pool's unit of bookkeeping, its factory trait, and the RAII handle
//! callers receive from `acquire`.

use std::future::Future;
use std::time::Instant;

use crate::error::Result;

/// Opaque identity token for an entry, stable across acquire/release cycles.
///
/// Keys are arena-style slot indices, not the pooled object itself — unlike
/// designs that use the object as both map key and lock, a `Key` carries no
/// payload and can be copied freely.
pub type Key = u64;

/// Lifecycle state of a pooled entry.
///
/// `PendingRefresh` is only ever produced by the auto-scale engine; a plain
/// bounded pool's entries alternate between `Available` and `Acquired` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Inserted into the table but not yet visible to acquirers (transient).
    Initialized,
    /// Sitting in the available queue, free to be claimed.
    Available,
    /// Checked out by exactly one caller.
    Acquired,
    /// Terminal — the close hook has run (or will run) at most once.
    Closed,
    /// Checked out, but a refresh is owed once the holder releases it.
    PendingRefresh,
}

/// A table entry: one pooled object plus its state and timestamps.
///
/// `object` is `None` while the entry is checked out — the payload itself
/// has moved into the caller's [`PoolEntry`] — and `Some` otherwise.
pub(crate) struct Slot<T> {
    pub(crate) status: Status,
    pub(crate) object: Option<T>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
}

impl<T> Slot<T> {
    pub(crate) fn new_available(object: T) -> Self {
        let now = Instant::now();
        Self {
            status: Status::Available,
            object: Some(object),
            created_at: now,
            last_used: now,
        }
    }

    /// A freshly created entry, already checked out — the caller holds the
    /// payload, so the slot itself carries no object until release.
    pub(crate) fn new_acquired() -> Self {
        let now = Instant::now();
        Self {
            status: Status::Acquired,
            object: None,
            created_at: now,
            last_used: now,
        }
    }
}

/// Produces pooled payloads.
///
/// Modeled on a bb8-style resource trait: construction is the only
/// mandatory operation, and it is async because real pooled resources
/// (connections, worker threads) are usually built over I/O.
pub trait Factory: Send + Sync + 'static {
    /// The pooled payload type.
    type Object: Send + 'static;

    /// Construct a new payload. May fail; failures propagate to the
    /// acquirer (or are logged and swallowed on background paths).
    fn create(&self) -> impl Future<Output = Result<Self::Object>> + Send;
}

/// A hook invoked at most once per entry when it is permanently removed
/// from the pool (scale-in, refresh, or `close`).
pub type CloseHook<T> = Box<dyn Fn(T) + Send + Sync>;

/// A predicate the auto-scale sweep consults to decide whether an
/// otherwise-fresh entry should be refreshed anyway.
pub type StaleChecker<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// RAII handle to a checked-out pooled object.
///
/// Derefs to `&T`/`&mut T`. Call [`Pool::release`](crate::pool::Pool::release)
/// (or [`AutoScalePool::release`](crate::autoscale::AutoScalePool::release))
/// to return it explicitly; if a `PoolEntry` is simply dropped instead, the
/// same release path still runs — a caller forgetting to release can
/// shrink the pool's throughput, but it can never leak a permit.
pub struct PoolEntry<T> {
    pub(crate) key: Key,
    pub(crate) pool_id: u64,
    object: Option<T>,
    on_release: Option<Box<dyn FnOnce(Key, T) + Send>>,
}

impl<T> PoolEntry<T> {
    pub(crate) fn new(
        key: Key,
        pool_id: u64,
        object: T,
        on_release: Box<dyn FnOnce(Key, T) + Send>,
    ) -> Self {
        Self {
            key,
            pool_id,
            object: Some(object),
            on_release: Some(on_release),
        }
    }

    /// The entry's stable identity token.
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Take the object and the release callback out, defusing `Drop`.
    ///
    /// Used by `release()` implementations so the callback runs exactly
    /// once, synchronously, from the explicit call site instead of later
    /// from `Drop`.
    pub(crate) fn defuse(mut self) -> (Key, T) {
        let object = self
            .object
            .take()
            .expect("pool entry object already taken");
        self.on_release = None;
        (self.key, object)
    }
}

impl<T> std::ops::Deref for PoolEntry<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pool entry used after release")
    }
}

impl<T> std::ops::DerefMut for PoolEntry<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pool entry used after release")
    }
}

impl<T> Drop for PoolEntry<T> {
    fn drop(&mut self) {
        if let (Some(object), Some(on_release)) = (self.object.take(), self.on_release.take()) {
            on_release(self.key, object);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PoolEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("key", &self.key)
            .field("object", &self.object)
            .finish()
    }
}
