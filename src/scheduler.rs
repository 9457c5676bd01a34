//! Fixed pool of workers draining a shared task queue.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::task::MediaTask;

/// What a pool run produced.
#[derive(Debug)]
pub struct PoolReport<T> {
    /// One entry per task a worker picked up, in completion order.
    pub results: Vec<T>,
    /// Tasks left in the queue when the run was cancelled.
    pub not_started: Vec<MediaTask>,
    /// Tasks whose handler panicked and so produced no result.
    pub panicked: usize,
}

/// Runs up to `workers` tasks at once. Each worker pulls the next task only
/// after finishing its current one, so at most `workers` transfers are ever
/// in flight.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    #[must_use]
    pub fn new(workers: usize, cancel: CancellationToken) -> Self {
        Self {
            workers: workers.max(1),
            cancel,
        }
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Feed `tasks` to the workers and wait until the queue is drained or the
    /// run is cancelled.
    ///
    /// Cancellation stops workers from taking new tasks; in-flight handlers
    /// observe the same token and wind down on their own.
    pub async fn run<I, F, Fut, T>(&self, tasks: I, handler: F) -> PoolReport<T>
    where
        I: IntoIterator<Item = MediaTask>,
        F: Fn(MediaTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        for task in tasks {
            if task_tx.send(task).is_err() {
                break;
            }
        }
        drop(task_tx);

        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let handler = Arc::clone(&handler);
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(async move {
                let mut processed = 0usize;
                while !cancel.is_cancelled() {
                    let next = task_rx.lock().await.recv().await;
                    let Some(task) = next else { break };

                    let result = (*handler)(task).await;
                    processed += 1;
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
                debug!(worker_id, processed, "Worker finished");
            });

            handles.push(handle);
        }
        drop(result_tx);

        // A worker only dies by panicking inside a handler, taking exactly
        // one task with it.
        let mut panicked = 0;
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {e}");
                panicked += 1;
            }
        }

        let mut results = Vec::new();
        while let Ok(result) = result_rx.try_recv() {
            results.push(result);
        }

        let mut not_started = Vec::new();
        let mut task_rx = task_rx.lock().await;
        while let Ok(task) = task_rx.try_recv() {
            not_started.push(task);
        }

        PoolReport {
            results,
            not_started,
            panicked,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn tasks(n: usize) -> Vec<MediaTask> {
        (0..n)
            .map(|i| MediaTask::new(&format!("https://i.redd.it/{i}.jpg"), format!("/out/{i}.jpg"), "p"))
            .collect()
    }

    #[tokio::test]
    async fn test_every_task_runs_once() {
        let pool = WorkerPool::new(4, CancellationToken::new());

        let report = pool
            .run(tasks(25), |task| async move { task.normalized_key })
            .await;

        let mut keys = report.results;
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 25);
        assert!(report.not_started.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let pool = WorkerPool::new(3, CancellationToken::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.run(tasks(12), move |_task| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await
        };

        assert_eq!(report.results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancel_leaves_rest_unstarted() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(1, cancel.clone());

        let report = pool
            .run(tasks(5), move |task| {
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    task
                }
            })
            .await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.not_started.len(), 4);
    }

    #[tokio::test]
    async fn test_panicking_task_is_accounted_for() {
        let pool = WorkerPool::new(2, CancellationToken::new());

        let mut batch = tasks(6);
        batch[0].post_id = "boom".to_string();
        let report = pool
            .run(batch, |task| async move {
                assert!(task.post_id != "boom", "handler blew up");
                task
            })
            .await;

        assert_eq!(report.panicked, 1);
        assert_eq!(report.results.len() + report.panicked + report.not_started.len(), 6);
        assert_eq!(report.results.len(), 5);
    }

    #[tokio::test]
    async fn test_zero_workers_still_runs() {
        let pool = WorkerPool::new(0, CancellationToken::new());
        assert_eq!(pool.workers(), 1);
        let report = pool.run(tasks(2), |_| async {}).await;
        assert_eq!(report.results.len(), 2);
    }
}
