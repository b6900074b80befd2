//! Thread-pool façade: each object-pool entry owns a long-lived worker that
//! waits on a private mailbox for a task. `submit` is exactly "acquire a
//! worker, hand it the task, wait for it to finish."

use tokio::sync::{mpsc, oneshot};

use crate::autoscale::{AutoScaleConfig, AutoScalePool};
use crate::entry::{Factory, PoolEntry};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolConfig};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct MailboxJob {
    task: Task,
    ack: oneshot::Sender<()>,
}

/// A worker's mailbox handle. The payload pooled by both thread-pool
/// variants; dropping it drops the mailbox sender, which ends the worker's
/// receive loop.
struct Worker {
    tx: mpsc::Sender<MailboxJob>,
}

struct WorkerFactory;

impl Factory for WorkerFactory {
    type Object = Worker;

    async fn create(&self) -> Result<Worker> {
        let (tx, mut rx) = mpsc::channel::<MailboxJob>(1);
        tokio::spawn(async move {
            while let Some(MailboxJob { task, ack }) = rx.recv().await {
                if let Err(_panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("worker task panicked");
                }
                let _ = ack.send(());
            }
        });
        Ok(Worker { tx })
    }
}

async fn run_job(entry: &Worker, task: Task) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if entry.tx.send(MailboxJob { task, ack: ack_tx }).await.is_ok() {
        let _ = ack_rx.await;
    }
}

/// A bounded pool of workers. `submit` blocks until a worker is free;
/// `try_submit` fails fast with [`Error::PoolExhausted`] instead.
pub struct ThreadPool {
    pool: Pool<WorkerFactory>,
}

impl Clone for ThreadPool {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone() }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool").field("size", &self.pool.size()).finish()
    }
}

impl ThreadPool {
    /// Create a new thread pool, eagerly starting `config.min_size` workers.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        let pool = Pool::with_close_hook(WorkerFactory, config, |_worker| {
            #[cfg(feature = "tracing")]
            tracing::debug!("worker mailbox closed");
        })
        .await?;
        Ok(Self { pool })
    }

    /// Run `task` on a worker, blocking until one is free and the task has
    /// run to completion.
    pub async fn submit<Func>(&self, task: Func) -> Result<()>
    where
        Func: FnOnce() + Send + 'static,
    {
        let entry = self.pool.acquire().await?;
        run_job(&entry, Box::new(task)).await;
        self.pool.release(entry)
    }

    /// As [`ThreadPool::submit`], but fails immediately with
    /// [`Error::PoolExhausted`] if every worker is busy.
    pub async fn try_submit<Func>(&self, task: Func) -> Result<()>
    where
        Func: FnOnce() + Send + 'static,
    {
        let entry = self.pool.try_acquire().await?;
        run_job(&entry, Box::new(task)).await;
        self.pool.release(entry)
    }

    /// Number of workers currently resident in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    /// Close the pool; running workers finish their current task, then their
    /// mailboxes close and their receive loops end.
    pub fn close(&self) {
        self.pool.close();
    }
}

struct QueuedJob {
    task: Task,
    submitter_done: oneshot::Sender<()>,
}

/// As [`ThreadPool`], but backed by an [`AutoScalePool`] and fronted by a
/// bounded intake queue: a `submit` that finds every worker busy parks the
/// task in the queue instead of creating unbounded backpressure.
pub struct AutoScaleThreadPool {
    pool: AutoScalePool<WorkerFactory>,
    queue_tx: async_channel::Sender<QueuedJob>,
    queue_rx: async_channel::Receiver<QueuedJob>,
}

impl Clone for AutoScaleThreadPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            queue_tx: self.queue_tx.clone(),
            queue_rx: self.queue_rx.clone(),
        }
    }
}

impl std::fmt::Debug for AutoScaleThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaleThreadPool")
            .field("size", &self.pool.size())
            .field("queue_len", &self.queue_rx.len())
            .finish()
    }
}

impl AutoScaleThreadPool {
    /// Create a new auto-scaling thread pool with a bounded intake queue.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `queue_capacity` is zero, or if
    /// `pool_config`/`auto_config` are invalid.
    pub async fn new(
        pool_config: PoolConfig,
        auto_config: AutoScaleConfig,
        queue_capacity: usize,
    ) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(Error::configuration("queue_capacity must be >= 1"));
        }
        let pool = AutoScalePool::new(WorkerFactory, pool_config, auto_config).await?;
        let (queue_tx, queue_rx) = async_channel::bounded(queue_capacity);
        Ok(Self { pool, queue_tx, queue_rx })
    }

    /// Run `task`, blocking until a worker is free or a queue slot opens, and
    /// until the task has run to completion.
    pub async fn submit<Func>(&self, task: Func) -> Result<()>
    where
        Func: FnOnce() + Send + 'static,
    {
        match self.pool.try_acquire().await {
            Ok(entry) => {
                self.run_then_drain(entry, Box::new(task)).await;
                Ok(())
            }
            Err(Error::PoolExhausted { .. }) => {
                let (done_tx, done_rx) = oneshot::channel();
                self.queue_tx
                    .send(QueuedJob { task: Box::new(task), submitter_done: done_tx })
                    .await
                    .map_err(|_closed| Error::Closed)?;
                done_rx.await.map_err(|_closed| Error::Closed)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// As [`AutoScaleThreadPool::submit`], but fails immediately with
    /// [`Error::PoolExhausted`] if every worker is busy and the intake queue
    /// is full.
    pub async fn try_submit<Func>(&self, task: Func) -> Result<()>
    where
        Func: FnOnce() + Send + 'static,
    {
        match self.pool.try_acquire().await {
            Ok(entry) => {
                self.run_then_drain(entry, Box::new(task)).await;
                Ok(())
            }
            Err(Error::PoolExhausted { .. }) => {
                let (done_tx, done_rx) = oneshot::channel();
                self.queue_tx
                    .try_send(QueuedJob { task: Box::new(task), submitter_done: done_tx })
                    .map_err(|_full| Error::PoolExhausted {
                        current_size: self.pool.size(),
                        max_size: self.pool.max_size(),
                    })?;
                done_rx.await.map_err(|_closed| Error::Closed)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Run the caller's own task on a freshly-acquired worker, then hand the
    /// worker off to a detached pump that drains the intake queue before
    /// releasing it — without making this call wait on any but its own task.
    async fn run_then_drain(&self, entry: PoolEntry<Worker>, first_task: Task) {
        run_job(&entry, first_task).await;

        let me = self.clone();
        tokio::spawn(async move {
            me.drain_queue_then_release(entry).await;
        });
    }

    async fn drain_queue_then_release(&self, entry: PoolEntry<Worker>) {
        while let Ok(QueuedJob { task, submitter_done }) = self.queue_rx.try_recv() {
            run_job(&entry, task).await;
            let _ = submitter_done.send(());
        }
        let _ = self.pool.release(entry);
    }

    /// Number of workers currently resident in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    /// Close the pool and stop its background sweep. Tasks still sitting in
    /// the intake queue are abandoned.
    pub fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submit_runs_task_and_releases_worker() {
        let pool = ThreadPool::new(PoolConfig { min_size: 1, max_size: 1 }).await.unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_c = Arc::clone(&ran);
        pool.submit(move || {
            ran_c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn try_submit_fails_fast_when_saturated() {
        let pool = ThreadPool::new(PoolConfig { min_size: 1, max_size: 1 }).await.unwrap();
        let pool_c = pool.clone();
        let busy = tokio::spawn(async move {
            pool_c.submit(|| std::thread::sleep(Duration::from_millis(200))).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(pool.try_submit(|| {}).await, Err(Error::PoolExhausted { .. })));
        busy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let pool = ThreadPool::new(PoolConfig { min_size: 1, max_size: 1 }).await.unwrap();
        let result = pool.submit(|| panic!("boom")).await;
        assert!(result.is_ok());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_c = Arc::clone(&ran);
        pool.submit(move || {
            ran_c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn autoscale_thread_pool_queues_beyond_worker_capacity() {
        let pool = AutoScaleThreadPool::new(
            PoolConfig { min_size: 1, max_size: 2 },
            AutoScaleConfig::default(),
            2,
        )
        .await
        .unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                pool.submit(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn autoscale_try_submit_fails_once_workers_and_queue_are_full() {
        let pool = AutoScaleThreadPool::new(
            PoolConfig { min_size: 1, max_size: 1 },
            AutoScaleConfig::default(),
            1,
        )
        .await
        .unwrap();

        let pool_c = pool.clone();
        let occupy_worker = tokio::spawn(async move {
            pool_c.submit(|| std::thread::sleep(Duration::from_millis(150))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pool_c = pool.clone();
        let fill_queue = tokio::spawn(async move {
            pool_c.submit(|| std::thread::sleep(Duration::from_millis(150))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(pool.try_submit(|| {}).await, Err(Error::PoolExhausted { .. })));

        occupy_worker.await.unwrap().unwrap();
        fill_queue.await.unwrap().unwrap();
    }
}
