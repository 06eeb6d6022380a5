use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use super::cancel::CancelToken;
use super::coordinator::PoolMessage;
use super::task::{TaskFuture, TaskStatus};

/// Command sent from the coordinator to one worker.
pub(super) enum Job<T> {
    Run {
        task_id: String,
        timeout: Duration,
        cancel: CancelToken,
        work: TaskFuture<T>,
    },
    Stop,
}

/// Worker loop. Receives jobs, runs them with a per-task timeout, and
/// reports every outcome back to the coordinator. A panic inside a
/// task is contained here, reported as a fault, and ends the loop so
/// the coordinator can replace this worker.
pub(super) async fn run_worker<T: Send + 'static>(
    worker_id: u64,
    mut jobs: mpsc::UnboundedReceiver<Job<T>>,
    events: mpsc::UnboundedSender<PoolMessage<T>>,
) {
    debug!("Worker {} started", worker_id);

    let mut fault = false;

    while let Some(job) = jobs.recv().await {
        let Job::Run { task_id, timeout, cancel, work } = job else {
            break;
        };

        let started = Instant::now();
        let events_tx = events.clone();
        let started_task = task_id.clone();
        let (status, panicked) = execute(timeout, &cancel, work, move |work| {
            let _ = events_tx.send(PoolMessage::TaskStarted {
                task_id: started_task,
                work,
            });
        })
        .await;

        let _ = events.send(PoolMessage::TaskFinished {
            worker_id,
            task_id,
            status,
            execution_time: started.elapsed(),
        });

        if panicked {
            fault = true;
            break;
        }
    }

    let _ = events.send(PoolMessage::WorkerStopped { worker_id, fault });
    debug!("Worker {} stopped (fault: {})", worker_id, fault);
}

/// Run one task attempt. The work future runs as its own spawned task
/// so that a timeout or cancellation can abort it and a panic cannot
/// take the worker loop down with it. `on_spawn` receives the spawned
/// task's abort handle so the coordinator can kill the work even if
/// this worker never reports back.
async fn execute<T: Send + 'static>(
    timeout: Duration,
    cancel: &CancelToken,
    work: TaskFuture<T>,
    on_spawn: impl FnOnce(AbortHandle),
) -> (TaskStatus<T>, bool) {
    if cancel.is_cancelled() {
        return (TaskStatus::Cancelled, false);
    }

    let mut handle = tokio::spawn(work);
    on_spawn(handle.abort_handle());

    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            handle.abort();
            (TaskStatus::TimedOut, false)
        }
        _ = cancel.cancelled() => {
            handle.abort();
            (TaskStatus::Cancelled, false)
        }
        joined = &mut handle => match joined {
            Ok(Ok(value)) => (TaskStatus::Completed(value), false),
            Ok(Err(e)) => (TaskStatus::Failed { error: format!("{:#}", e) }, false),
            Err(e) if e.is_panic() => {
                (TaskStatus::Failed { error: panic_message(e) }, true)
            }
            Err(_) => (TaskStatus::Cancelled, false),
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", msg)
    } else {
        "task panicked".to_string()
    }
}
