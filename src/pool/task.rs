use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Boxed unit of work executed by a pool worker.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Queue placement for a submitted task. High priority tasks are
/// dispatched ahead of pending normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Normal,
    High,
}

/// A unit of work plus its scheduling parameters.
pub struct TaskSpec<T> {
    pub task_id: String,
    pub priority: TaskPriority,
    /// Overrides the pool-wide task timeout when set.
    pub timeout: Option<Duration>,
    pub work: TaskFuture<T>,
}

impl<T> TaskSpec<T> {
    pub fn new(task_id: impl Into<String>, work: TaskFuture<T>) -> Self {
        Self {
            task_id: task_id.into(),
            priority: TaskPriority::Normal,
            timeout: None,
            work,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal state of a single task attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus<T> {
    Completed(T),
    Failed { error: String },
    TimedOut,
    Cancelled,
}

impl<T> TaskStatus<T> {
    /// Failures and timeouts may be resubmitted by the caller;
    /// completion and cancellation are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. } | TaskStatus::TimedOut)
    }
}

/// What the pool reports back for a finished task.
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub status: TaskStatus<T>,
    /// None when the task never reached a worker (rejected from the
    /// queue by cancellation).
    pub worker_id: Option<u64>,
    pub execution_time: Duration,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(TaskStatus::<()>::Failed { error: "x".into() }.is_retryable());
        assert!(TaskStatus::<()>::TimedOut.is_retryable());
        assert!(!TaskStatus::Completed(()).is_retryable());
        assert!(!TaskStatus::<()>::Cancelled.is_retryable());
    }

    #[test]
    fn test_spec_builder_defaults() {
        let spec: TaskSpec<()> = TaskSpec::new("t1", Box::pin(async { Ok(()) }));
        assert_eq!(spec.task_id, "t1");
        assert_eq!(spec.priority, TaskPriority::Normal);
        assert!(spec.timeout.is_none());

        let spec = spec
            .with_priority(TaskPriority::High)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
    }
}
