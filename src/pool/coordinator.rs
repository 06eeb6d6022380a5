use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::task::{TaskFuture, TaskPriority, TaskResult, TaskSpec, TaskStatus};
use super::worker::{run_worker, Job};
use super::{PoolStats, WorkerSnapshot, WorkerStatus};
use crate::config::WorkerConfig;

/// Everything the coordinator reacts to: caller requests and worker
/// reports share one channel, so queue and worker bookkeeping have a
/// single writer.
pub(super) enum PoolMessage<T> {
    Submit {
        spec: TaskSpec<T>,
        reply: oneshot::Sender<TaskResult<T>>,
    },
    CancelAll {
        ack: oneshot::Sender<usize>,
    },
    Terminate {
        ack: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    TaskStarted {
        task_id: String,
        work: AbortHandle,
    },
    TaskFinished {
        worker_id: u64,
        task_id: String,
        status: TaskStatus<T>,
        execution_time: Duration,
    },
    WorkerStopped {
        worker_id: u64,
        fault: bool,
    },
}

struct QueuedTask<T> {
    task_id: String,
    priority: TaskPriority,
    timeout: Option<Duration>,
    work: TaskFuture<T>,
    reply: oneshot::Sender<TaskResult<T>>,
}

struct RunningTask<T> {
    reply: oneshot::Sender<TaskResult<T>>,
    worker_id: u64,
    started: Instant,
    /// Past this point the worker has missed its own timeout report
    /// and is presumed wedged.
    presumed_dead_at: Instant,
    /// Abort handle for the spawned work, reported by the worker when
    /// the attempt starts.
    work: Option<AbortHandle>,
}

struct WorkerSlot<T> {
    jobs: mpsc::UnboundedSender<Job<T>>,
    join: JoinHandle<()>,
    status: WorkerStatus,
    current_task: Option<String>,
    tasks_completed: u64,
    error_count: u64,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    idle_since: Instant,
}

pub(super) struct Coordinator<T> {
    config: WorkerConfig,
    rx: mpsc::UnboundedReceiver<PoolMessage<T>>,
    /// Cloned into each worker so they can report back.
    tx: mpsc::UnboundedSender<PoolMessage<T>>,
    queue: VecDeque<QueuedTask<T>>,
    workers: HashMap<u64, WorkerSlot<T>>,
    running: HashMap<String, RunningTask<T>>,
    /// Current cancellation generation; replaced after each
    /// `cancel_all` so later submissions start fresh.
    cancel: CancelToken,
    next_worker_id: u64,
    shutting_down: bool,
}

impl<T: Send + 'static> Coordinator<T> {
    pub(super) fn new(
        config: WorkerConfig,
        rx: mpsc::UnboundedReceiver<PoolMessage<T>>,
        tx: mpsc::UnboundedSender<PoolMessage<T>>,
    ) -> Self {
        let mut coordinator = Self {
            config,
            rx,
            tx,
            queue: VecDeque::new(),
            workers: HashMap::new(),
            running: HashMap::new(),
            cancel: CancelToken::new(),
            next_worker_id: 0,
            shutting_down: false,
        };
        for _ in 0..coordinator.config.min_workers {
            coordinator.spawn_worker();
        }
        coordinator
    }

    pub(super) async fn run(mut self) {
        info!(
            "Worker pool started ({}..{} workers)",
            self.config.min_workers, self.config.max_workers
        );

        let mut tick = tokio::time::interval(self.config.maintenance_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        if self.handle_message(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.maintain(),
            }
        }

        debug!("Pool coordinator stopped");
    }

    /// Returns true once the pool has terminated.
    fn handle_message(&mut self, msg: PoolMessage<T>) -> bool {
        match msg {
            PoolMessage::Submit { spec, reply } => {
                self.enqueue(spec, reply);
                self.dispatch();
            }
            PoolMessage::CancelAll { ack } => {
                let rejected = self.cancel_all();
                let _ = ack.send(rejected);
            }
            PoolMessage::Terminate { ack } => {
                self.terminate();
                let _ = ack.send(());
                return true;
            }
            PoolMessage::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PoolMessage::TaskStarted { task_id, work } => match self.running.get_mut(&task_id) {
                Some(running) => running.work = Some(work),
                // The task was already resolved (reaped, cancelled, or
                // its worker died); nothing owns the work anymore.
                None => work.abort(),
            },
            PoolMessage::TaskFinished {
                worker_id,
                task_id,
                status,
                execution_time,
            } => {
                self.task_finished(worker_id, task_id, status, execution_time);
                self.dispatch();
            }
            PoolMessage::WorkerStopped { worker_id, fault } => {
                self.worker_stopped(worker_id, fault);
                self.dispatch();
            }
        }
        false
    }

    fn enqueue(&mut self, spec: TaskSpec<T>, reply: oneshot::Sender<TaskResult<T>>) {
        let task = QueuedTask {
            task_id: spec.task_id,
            priority: spec.priority,
            timeout: spec.timeout,
            work: spec.work,
            reply,
        };
        match task.priority {
            TaskPriority::High => {
                // Behind earlier high priority tasks, ahead of normal ones.
                let pos = self
                    .queue
                    .iter()
                    .position(|t| t.priority == TaskPriority::Normal)
                    .unwrap_or(self.queue.len());
                self.queue.insert(pos, task);
            }
            TaskPriority::Normal => self.queue.push_back(task),
        }
    }

    /// Pair queued tasks with idle workers, growing the pool toward
    /// the maximum while tasks are waiting.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let worker_id = match self.idle_worker() {
                Some(id) => id,
                None if self.workers.len() < self.config.max_workers && !self.shutting_down => {
                    self.spawn_worker()
                }
                None => break,
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.assign(worker_id, task);
        }
    }

    fn idle_worker(&self) -> Option<u64> {
        self.workers
            .iter()
            .find(|(_, slot)| slot.status == WorkerStatus::Idle)
            .map(|(id, _)| *id)
    }

    fn assign(&mut self, worker_id: u64, task: QueuedTask<T>) {
        let QueuedTask {
            task_id,
            priority,
            timeout,
            work,
            reply,
        } = task;
        let timeout = timeout.unwrap_or_else(|| self.config.task_timeout());

        let send_result = match self.workers.get_mut(&worker_id) {
            Some(slot) => slot.jobs.send(Job::Run {
                task_id: task_id.clone(),
                timeout,
                cancel: self.cancel.clone(),
                work,
            }),
            None => return,
        };

        match send_result {
            Ok(()) => {
                let now = Instant::now();
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.status = WorkerStatus::Busy;
                    slot.current_task = Some(task_id.clone());
                    slot.last_active_at = Utc::now();
                }
                self.running.insert(
                    task_id,
                    RunningTask {
                        reply,
                        worker_id,
                        started: now,
                        presumed_dead_at: now + timeout + self.config.unresponsive_grace(),
                        work: None,
                    },
                );
            }
            Err(rejected) => {
                // Worker loop already gone; drop the slot and requeue.
                warn!("Worker {} rejected a job, removing it", worker_id);
                if let Some(slot) = self.workers.remove(&worker_id) {
                    slot.join.abort();
                }
                if let Job::Run { work, .. } = rejected.0 {
                    let spec = TaskSpec {
                        task_id,
                        priority,
                        timeout: Some(timeout),
                        work,
                    };
                    self.enqueue(spec, reply);
                }
            }
        }
    }

    fn spawn_worker(&mut self) -> u64 {
        self.next_worker_id += 1;
        let id = self.next_worker_id;
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run_worker(id, jobs_rx, self.tx.clone()));

        let now = Utc::now();
        self.workers.insert(
            id,
            WorkerSlot {
                jobs: jobs_tx,
                join,
                status: WorkerStatus::Idle,
                current_task: None,
                tasks_completed: 0,
                error_count: 0,
                created_at: now,
                last_active_at: now,
                idle_since: Instant::now(),
            },
        );
        debug!("Spawned worker {} ({} workers total)", id, self.workers.len());
        id
    }

    fn task_finished(
        &mut self,
        worker_id: u64,
        task_id: String,
        status: TaskStatus<T>,
        execution_time: Duration,
    ) {
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            slot.status = WorkerStatus::Idle;
            slot.current_task = None;
            slot.last_active_at = Utc::now();
            slot.idle_since = Instant::now();
            match &status {
                TaskStatus::Completed(_) => slot.tasks_completed += 1,
                status if status.is_retryable() => slot.error_count += 1,
                _ => {}
            }
        }

        // Absent entry means the unresponsive sweep already resolved it.
        let Some(running) = self.running.remove(&task_id) else {
            return;
        };
        let _ = running.reply.send(TaskResult {
            task_id,
            status,
            worker_id: Some(worker_id),
            execution_time,
            completed_at: Utc::now(),
        });
    }

    fn worker_stopped(&mut self, worker_id: u64, fault: bool) {
        if self.workers.remove(&worker_id).is_none() {
            // Already retired by scale-down or terminate.
            return;
        }

        // A worker that died without reporting its task fails it.
        let orphaned: Vec<String> = self
            .running
            .iter()
            .filter(|(_, r)| r.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in orphaned {
            if let Some(running) = self.running.remove(&task_id) {
                if let Some(work) = &running.work {
                    work.abort();
                }
                let _ = running.reply.send(TaskResult {
                    task_id,
                    status: TaskStatus::Failed {
                        error: "worker stopped unexpectedly".to_string(),
                    },
                    worker_id: Some(worker_id),
                    execution_time: running.started.elapsed(),
                    completed_at: Utc::now(),
                });
            }
        }

        if fault && !self.shutting_down && self.workers.len() < self.config.max_workers {
            warn!("Worker {} faulted, scheduling a replacement", worker_id);
            self.spawn_worker();
        }
    }

    /// Reject every queued task and signal cancellation to every
    /// running one. Returns the number of rejected queued tasks.
    fn cancel_all(&mut self) -> usize {
        let rejected = self.queue.len();
        for task in self.queue.drain(..) {
            let QueuedTask { task_id, reply, .. } = task;
            let _ = reply.send(TaskResult {
                task_id,
                status: TaskStatus::Cancelled,
                worker_id: None,
                execution_time: Duration::ZERO,
                completed_at: Utc::now(),
            });
        }

        // Running tasks observe this at their next checkpoint; later
        // submissions get a fresh generation.
        self.cancel.cancel();
        self.cancel = CancelToken::new();

        if rejected > 0 {
            info!("Cancelled {} queued tasks", rejected);
        }
        rejected
    }

    fn terminate(&mut self) {
        self.shutting_down = true;
        let rejected = self.cancel_all();
        debug!("Terminating pool ({} queued tasks rejected)", rejected);

        for (task_id, running) in self.running.drain() {
            if let Some(work) = &running.work {
                work.abort();
            }
            let _ = running.reply.send(TaskResult {
                task_id,
                status: TaskStatus::Cancelled,
                worker_id: Some(running.worker_id),
                execution_time: running.started.elapsed(),
                completed_at: Utc::now(),
            });
        }

        // Workers see the cancelled token, abort their current work,
        // then exit on the stop command.
        for (_, slot) in self.workers.drain() {
            let _ = slot.jobs.send(Job::Stop);
        }

        // Close before acking so a submit after terminate() returns is
        // guaranteed to fail rather than race the coordinator exit.
        self.rx.close();
        info!("Worker pool terminated");
    }

    fn maintain(&mut self) {
        self.reap_unresponsive();
        self.scale_up();
        self.scale_down();
        self.dispatch();
    }

    fn reap_unresponsive(&mut self) {
        let now = Instant::now();
        let wedged: Vec<(String, u64)> = self
            .running
            .iter()
            .filter(|(_, r)| now >= r.presumed_dead_at)
            .map(|(task_id, r)| (task_id.clone(), r.worker_id))
            .collect();

        for (task_id, worker_id) in wedged {
            warn!(
                "Worker {} missed its deadline on task {}, replacing it",
                worker_id, task_id
            );
            if let Some(running) = self.running.remove(&task_id) {
                // Aborting the worker loop detaches the work it
                // spawned; kill that too.
                if let Some(work) = &running.work {
                    work.abort();
                }
                let _ = running.reply.send(TaskResult {
                    task_id,
                    status: TaskStatus::TimedOut,
                    worker_id: Some(worker_id),
                    execution_time: running.started.elapsed(),
                    completed_at: Utc::now(),
                });
            }
            if let Some(slot) = self.workers.remove(&worker_id) {
                slot.join.abort();
            }
            if !self.shutting_down && self.workers.len() < self.config.max_workers {
                self.spawn_worker();
            }
        }
    }

    /// Grow when the queue outpaces idle capacity.
    fn scale_up(&mut self) {
        let idle = self.count(WorkerStatus::Idle);
        if self.queue.len() > idle * 2 && self.workers.len() < self.config.max_workers {
            debug!(
                "Queue depth {} exceeds idle capacity, growing pool",
                self.queue.len()
            );
            self.spawn_worker();
        }
    }

    /// Retire idle workers beyond the minimum once their idle timeout
    /// has elapsed. Retired workers stay visible as `terminated` until
    /// their stop report arrives.
    fn scale_down(&mut self) {
        let idle_timeout = self.config.idle_timeout();
        let terminated = self.count(WorkerStatus::Terminated);
        let mut excess = (self.workers.len() - terminated).saturating_sub(self.config.min_workers);
        if excess == 0 {
            return;
        }

        let expired: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, s)| {
                s.status == WorkerStatus::Idle && s.idle_since.elapsed() >= idle_timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for worker_id in expired {
            if excess == 0 {
                break;
            }
            if let Some(slot) = self.workers.get_mut(&worker_id) {
                debug!("Retiring idle worker {}", worker_id);
                slot.status = WorkerStatus::Terminated;
                let _ = slot.jobs.send(Job::Stop);
                excess -= 1;
            }
        }
    }

    fn count(&self, status: WorkerStatus) -> usize {
        self.workers.values().filter(|s| s.status == status).count()
    }

    fn stats(&self) -> PoolStats {
        let mut workers: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|(id, slot)| WorkerSnapshot {
                id: *id,
                status: slot.status,
                current_task: slot.current_task.clone(),
                tasks_completed: slot.tasks_completed,
                error_count: slot.error_count,
                created_at: slot.created_at,
                last_active_at: slot.last_active_at,
            })
            .collect();
        workers.sort_by_key(|w| w.id);

        PoolStats {
            max_workers: self.config.max_workers,
            busy_workers: self.count(WorkerStatus::Busy),
            idle_workers: self.count(WorkerStatus::Idle),
            queued_tasks: self.queue.len(),
            workers,
        }
    }
}
