//! Priority work executor
//!
//! A bounded pool for git subprocess execution and other disk-heavy jobs.
//! Pending jobs are dequeued lowest-priority-number first (FIFO within a
//! priority), so latency-sensitive pack runs are never starved behind bulk
//! background jobs sharing the pool. A running job is never preempted.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

/// Priority reserved for git pack execution.
pub const GIT_PRIORITY: u32 = 2;

#[derive(Error, Debug)]
pub enum WorkError {
    #[error("task abandoned before completion")]
    Abandoned,
}

struct Job {
    priority: u32,
    seq: u64,
    fut: BoxFuture<'static, ()>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops
// first.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct Inner {
    queue: Mutex<BinaryHeap<Job>>,
    notify: Notify,
    seq: AtomicU64,
}

tokio::task_local! {
    static IN_WORKER: ();
}

/// Handle to a submitted job. Awaiting it parks the caller without
/// occupying a pool worker.
pub struct WorkHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> WorkHandle<T> {
    /// Wait for the job to complete, returning its result. If the job
    /// panicked or the pool went away the result is lost and an error is
    /// returned instead.
    pub async fn wait(self) -> Result<T, WorkError> {
        self.rx.await.map_err(|_| WorkError::Abandoned)
    }
}

#[derive(Clone)]
pub struct WorkExecutor {
    inner: Arc<Inner>,
}

impl WorkExecutor {
    /// Create a pool with a fixed number of workers.
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        });
        for _ in 0..workers.max(1) {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    let job = inner.queue.lock().expect("work queue poisoned").pop();
                    match job {
                        Some(job) => {
                            // Run inside a spawned task so a panicking job
                            // surfaces as a JoinError and the worker
                            // survives.
                            let _ = tokio::spawn(IN_WORKER.scope((), job.fut)).await;
                        }
                        None => inner.notify.notified().await,
                    }
                }
            });
        }
        Self { inner }
    }

    /// Submit a job at the given priority (smaller runs sooner).
    ///
    /// A job submitted from within a pool worker starts immediately as an
    /// independent task instead of queueing: the submitting job may be
    /// holding the only worker while it waits, and queueing behind itself
    /// would wedge the pool.
    pub fn submit<F, T>(&self, priority: u32, task: F) -> WorkHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let fut = async move {
            let _ = tx.send(task.await);
        }
        .boxed();

        if IN_WORKER.try_with(|_| ()).is_ok() {
            tokio::spawn(fut);
        } else {
            let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
            self.inner
                .queue
                .lock()
                .expect("work queue poisoned")
                .push(Job { priority, seq, fut });
            self.inner.notify.notify_one();
        }
        WorkHandle { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_result_roundtrip() {
        let pool = WorkExecutor::new(2);
        let handle = pool.submit(5, async { 40 + 2 });
        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_lower_priority_number_runs_first() {
        let pool = WorkExecutor::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so the rest queue up
        let gate = pool.submit(0, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for (priority, tag) in [(9u32, "slow"), (GIT_PRIORITY, "git"), (9, "slow2")] {
            let order = order.clone();
            handles.push(pool.submit(priority, async move {
                order.lock().unwrap().push(tag);
            }));
        }
        gate.wait().await.unwrap();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(order[0], "git");
        // FIFO within the same priority
        assert_eq!(&order[1..], ["slow", "slow2"]);
    }

    #[tokio::test]
    async fn test_submit_from_worker_does_not_deadlock() {
        let pool = WorkExecutor::new(1);
        let outer_pool = pool.clone();
        let handle = pool.submit(1, async move {
            let inner = outer_pool.submit(1, async { 7 });
            inner.wait().await.unwrap()
        });
        let value = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("pool deadlocked")
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_pool() {
        let pool = WorkExecutor::new(1);
        let bad = pool.submit(1, async { panic!("job blew up") });
        assert!(matches!(bad.wait().await, Err(WorkError::Abandoned)));

        let good = pool.submit(1, async { "still alive" });
        assert_eq!(good.wait().await.unwrap(), "still alive");
    }
}
