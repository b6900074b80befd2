//! End-to-end scenarios spanning the bounded pool, the auto-scale engine,
//! and the thread-pool façade together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use scalepool::{AutoScaleConfig, AutoScalePool, Error, Factory, Pool, PoolConfig, Result};

struct CounterFactory {
    next: AtomicU32,
}

impl Factory for CounterFactory {
    type Object = u32;

    async fn create(&self) -> Result<u32> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

fn counter() -> CounterFactory {
    CounterFactory { next: AtomicU32::new(0) }
}

#[tokio::test]
async fn bounded_pool_exhausts_then_reuses_released_payload() {
    let pool = Pool::new(counter(), PoolConfig { min_size: 0, max_size: 3 }).await.unwrap();

    let e0 = pool.acquire().await.unwrap();
    let e1 = pool.acquire().await.unwrap();
    let e2 = pool.acquire().await.unwrap();
    assert_eq!((*e0, *e1, *e2), (0, 1, 2));

    assert!(matches!(pool.try_acquire().await, Err(Error::PoolExhausted { .. })));

    pool.release(e1).unwrap();
    let reused = pool.acquire().await.unwrap();
    assert_eq!(*reused, 1);

    drop(e0);
    drop(e2);
    drop(reused);
}

#[tokio::test]
async fn concurrent_acquirers_block_until_a_release_wakes_one() {
    let pool = Arc::new(Pool::new(counter(), PoolConfig { min_size: 0, max_size: 1 }).await.unwrap());
    let held = pool.acquire().await.unwrap();

    let waiter_pool = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await.unwrap() });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished(), "waiter should still be blocked on the single permit");

    pool.release(held).unwrap();
    let woken = waiter.await.unwrap();
    assert_eq!(*woken, 0);
}

#[tokio::test]
async fn autoscale_pool_reaches_target_size_without_blocking_first_caller() {
    let pool = AutoScalePool::new(
        counter(),
        PoolConfig { min_size: 0, max_size: 10 },
        AutoScaleConfig { scale_factor: 5, ..Default::default() },
    )
    .await
    .unwrap();

    let first = pool.acquire().await.unwrap();
    assert_eq!(*first, 0, "the caller's own entry must not wait on the scale-out batch");

    for _ in 0..30 {
        if pool.size() >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(pool.size() >= 5, "scale-out batch should have grown the pool to at least 5, got {}", pool.size());
}

#[tokio::test]
async fn autoscale_pool_scales_back_down_to_floor_after_idling() {
    let pool = AutoScalePool::new(
        counter(),
        PoolConfig { min_size: 1, max_size: 10 },
        AutoScaleConfig {
            check_interval: Duration::from_millis(50),
            max_idle_time: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut entries = Vec::new();
    for _ in 0..5 {
        entries.push(pool.acquire().await.unwrap());
    }
    for entry in entries {
        pool.release(entry).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.size(), 1);
    pool.close();
}
