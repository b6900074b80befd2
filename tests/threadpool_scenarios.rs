//! End-to-end scenarios for the thread-pool façade.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use scalepool::{AutoScaleConfig, AutoScaleThreadPool, Error, PoolConfig, ThreadPool};

#[tokio::test]
async fn bounded_thread_pool_runs_task_and_frees_worker_for_reuse() {
    let pool = ThreadPool::new(PoolConfig { min_size: 1, max_size: 1 }).await.unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let ran_c = Arc::clone(&ran);
    pool.submit(move || {
        ran_c.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();

    let ran_c = Arc::clone(&ran);
    pool.submit(move || {
        ran_c.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert_eq!(pool.size(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn autoscale_thread_pool_queues_excess_work_beyond_worker_capacity() {
    // min=1, max=2, queue_capacity=2: five long tasks submitted concurrently
    // should all eventually complete — two run immediately, two queue, and
    // the fifth's `submit` blocks until a slot frees.
    let pool = AutoScaleThreadPool::new(
        PoolConfig { min_size: 1, max_size: 2 },
        AutoScaleConfig::default(),
        2,
    )
    .await
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(60));
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .await
        }));
    }

    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn autoscale_thread_pool_try_submit_rejects_once_saturated() {
    let pool = AutoScaleThreadPool::new(
        PoolConfig { min_size: 1, max_size: 1 },
        AutoScaleConfig::default(),
        1,
    )
    .await
    .unwrap();

    let worker_pool = pool.clone();
    let occupy_worker =
        tokio::spawn(async move { worker_pool.submit(|| std::thread::sleep(Duration::from_millis(150))).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queue_pool = pool.clone();
    let fill_queue =
        tokio::spawn(async move { queue_pool.submit(|| std::thread::sleep(Duration::from_millis(150))).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(pool.try_submit(|| {}).await, Err(Error::PoolExhausted { .. })));

    occupy_worker.await.unwrap().unwrap();
    fill_queue.await.unwrap().unwrap();
}
