//! Bounded and auto-scaling object pools, with a worker thread-pool façade
//! built directly on top of the same engine.
//!
//! [`Pool`] lazily manufactures up to `max_size` objects from a
//! user-supplied [`Factory`] and hands them out as RAII [`PoolEntry`]
//! guards. [`AutoScalePool`] wraps a `Pool` with batched scale-out, periodic
//! scale-in, and TTL/stale refresh. [`ThreadPool`] and
//! [`AutoScaleThreadPool`] specialize the two pool variants to a fixed
//! `Worker` payload, turning `acquire`/`release` into `submit`/`try_submit`.

pub mod autoscale;
pub mod entry;
pub mod error;
pub mod pool;
pub mod threadpool;

pub use autoscale::{AutoScaleConfig, AutoScalePool};
pub use entry::{CloseHook, Factory, Key, PoolEntry, StaleChecker, Status};
pub use error::{Error, Result};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use threadpool::{AutoScaleThreadPool, ThreadPool};
