//! Bounded worker pool.
//!
//! A single coordinator task owns the queue and all busy/idle
//! bookkeeping; workers run independently and report back over the
//! coordinator's channel. Tasks run with a per-task timeout, faulted
//! workers are replaced, and the pool grows and shrinks between its
//! configured minimum and maximum.

mod cancel;
mod coordinator;
mod task;
mod worker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::WorkerConfig;
use coordinator::{Coordinator, PoolMessage};

pub use cancel::CancelToken;
pub use task::{TaskFuture, TaskPriority, TaskResult, TaskSpec, TaskStatus};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool is terminated")]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Terminated,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub workers: Vec<WorkerSnapshot>,
}

/// Handle to a running pool. Clones share the same coordinator.
pub struct WorkerPool<T> {
    tx: mpsc::UnboundedSender<PoolMessage<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start a pool with `min_workers` eager workers, growing to
    /// `max_workers` under load. Must be called inside a runtime.
    pub fn new(config: &WorkerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(config.clone(), rx, tx.clone());
        tokio::spawn(coordinator.run());
        Self { tx }
    }

    /// Enqueue a task. The returned handle resolves once the task
    /// reaches a terminal status.
    pub fn submit(&self, spec: TaskSpec<T>) -> Result<TaskHandle<T>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Submit { spec, reply })
            .map_err(|_| PoolError::Terminated)?;
        Ok(TaskHandle { rx })
    }

    /// Reject every queued task and cancel running ones. Returns the
    /// number of rejected queued tasks.
    pub async fn cancel_all(&self) -> Result<usize, PoolError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::CancelAll { ack })
            .map_err(|_| PoolError::Terminated)?;
        rx.await.map_err(|_| PoolError::Terminated)
    }

    /// Cancel everything and stop all workers. Later submissions fail
    /// with [`PoolError::Terminated`].
    pub async fn terminate(&self) -> Result<(), PoolError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Terminate { ack })
            .map_err(|_| PoolError::Terminated)?;
        rx.await.map_err(|_| PoolError::Terminated)
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Stats { reply })
            .map_err(|_| PoolError::Terminated)?;
        rx.await.map_err(|_| PoolError::Terminated)
    }
}

/// Resolves to the task's result once it finishes.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<TaskResult<T>>,
}

impl<T> TaskHandle<T> {
    pub async fn wait(self) -> Result<TaskResult<T>, PoolError> {
        self.rx.await.map_err(|_| PoolError::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn pool_config(min: usize, max: usize) -> WorkerConfig {
        WorkerConfig {
            min_workers: min,
            max_workers: max,
            task_timeout_secs: 5,
            idle_timeout_secs: 1,
            maintenance_interval_ms: 25,
            unresponsive_grace_secs: 5,
        }
    }

    fn sleeper(millis: u64) -> TaskFuture<u32> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis as u32)
        })
    }

    #[tokio::test]
    async fn test_all_tasks_complete_and_busy_never_exceeds_max() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 2));

        let max_busy = Arc::new(AtomicUsize::new(0));
        let sampler = {
            let pool = pool.clone();
            let max_busy = Arc::clone(&max_busy);
            tokio::spawn(async move {
                for _ in 0..30 {
                    if let Ok(stats) = pool.stats().await {
                        max_busy.fetch_max(stats.busy_workers, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let mut handles = Vec::new();
        for i in 0..6 {
            let spec = TaskSpec::new(format!("task-{}", i), sleeper(30));
            handles.push(pool.submit(spec).unwrap());
        }
        for handle in handles {
            let result = handle.wait().await.unwrap();
            assert!(matches!(result.status, TaskStatus::Completed(30)));
            assert!(result.worker_id.is_some());
        }

        sampler.await.unwrap();
        assert!(max_busy.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_high_priority_dispatches_before_queued_normals() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 1));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let record = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| -> TaskFuture<u32> {
            let order = Arc::clone(order);
            Box::pin(async move {
                order.lock().await.push(label);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(0)
            })
        };

        let blocker = pool
            .submit(TaskSpec::new("blocker", record("blocker", &order)))
            .unwrap();
        let n1 = pool.submit(TaskSpec::new("n1", record("n1", &order))).unwrap();
        let n2 = pool.submit(TaskSpec::new("n2", record("n2", &order))).unwrap();
        let h1 = pool
            .submit(TaskSpec::new("h1", record("h1", &order)).with_priority(TaskPriority::High))
            .unwrap();
        let h2 = pool
            .submit(TaskSpec::new("h2", record("h2", &order)).with_priority(TaskPriority::High))
            .unwrap();

        for handle in [blocker, n1, n2, h1, h2] {
            handle.wait().await.unwrap();
        }

        let order = order.lock().await;
        assert_eq!(*order, vec!["blocker", "h1", "h2", "n1", "n2"]);
    }

    #[tokio::test]
    async fn test_timeout_reports_timed_out_and_worker_survives() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 1));

        let slow = TaskSpec::new("slow", sleeper(10_000)).with_timeout(Duration::from_millis(30));
        let result = pool.submit(slow).unwrap().wait().await.unwrap();
        assert!(matches!(result.status, TaskStatus::TimedOut));
        assert!(result.execution_time >= Duration::from_millis(30));

        let quick = pool.submit(TaskSpec::new("quick", sleeper(1))).unwrap();
        let result = quick.wait().await.unwrap();
        assert!(matches!(result.status, TaskStatus::Completed(1)));
    }

    #[tokio::test]
    async fn test_panicking_task_fails_and_worker_is_replaced() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 2));

        let bad: TaskFuture<u32> = Box::pin(async { panic!("exploded") });
        let result = pool.submit(TaskSpec::new("bad", bad)).unwrap().wait().await.unwrap();
        match result.status {
            TaskStatus::Failed { error } => assert!(error.contains("panicked")),
            other => panic!("expected Failed, got {:?}", other),
        }

        let result = pool
            .submit(TaskSpec::new("good", sleeper(1)))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(matches!(result.status, TaskStatus::Completed(1)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats().await.unwrap();
        assert!(!stats.workers.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_empties_queue_and_queued_tasks_never_run() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 1));
        let queued_ran = Arc::new(AtomicBool::new(false));

        let blocker = pool.submit(TaskSpec::new("blocker", sleeper(10_000))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut queued = Vec::new();
        for i in 0..3 {
            let flag = Arc::clone(&queued_ran);
            let work: TaskFuture<u32> = Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(0)
            });
            queued.push(pool.submit(TaskSpec::new(format!("queued-{}", i), work)).unwrap());
        }

        let rejected = pool.cancel_all().await.unwrap();
        assert_eq!(rejected, 3);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.queued_tasks, 0);

        for handle in queued {
            let result = handle.wait().await.unwrap();
            assert!(matches!(result.status, TaskStatus::Cancelled));
        }
        let result = blocker.wait().await.unwrap();
        assert!(matches!(result.status, TaskStatus::Cancelled));
        assert!(!queued_ran.load(Ordering::SeqCst));

        // Cancellation applies to one generation only.
        let after = pool.submit(TaskSpec::new("after", sleeper(1))).unwrap();
        let result = after.wait().await.unwrap();
        assert!(matches!(result.status, TaskStatus::Completed(1)));
    }

    #[tokio::test]
    async fn test_submit_after_terminate_fails() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 2));
        pool.terminate().await.unwrap();

        let err = pool.submit(TaskSpec::new("late", sleeper(1))).unwrap_err();
        assert!(matches!(err, PoolError::Terminated));
    }

    #[tokio::test]
    async fn test_pool_shrinks_back_to_min_after_idle_timeout() {
        let pool: WorkerPool<u32> = WorkerPool::new(&pool_config(1, 3));

        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(pool.submit(TaskSpec::new(format!("t{}", i), sleeper(80))).unwrap());
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let stats = pool.stats().await.unwrap();
        assert!(stats.workers.len() > 1);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 1);
    }
}
