//! # Background Task Runner
//!
//! Fire-and-forget execution for work that must not sit on the reply path:
//! cache warming, session refreshes, monitoring sweeps. Submission never
//! blocks the caller — a full queue either rejects the new task or sheds the
//! oldest pending one, per policy — and a task failure is retried a bounded
//! number of times, then counted and dropped. By the time a task runs, the
//! originating request has already been answered, so nothing here ever
//! propagates back to it.
//!
//! The queue is an explicit, bounded structure with observable counters and
//! a `drain` operation, so tests can run background work to quiescence
//! deterministically instead of sleeping and hoping.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::{OverflowPolicy, TasksConfig};
use crate::core::error::{PipelineError, PipelineResult};

/// Boxed unit of background work
pub type TaskFuture = Pin<Box<dyn Future<Output = PipelineResult<()>> + Send>>;

/// Re-invokable work constructor; called once per attempt
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A queued unit of work with submission metadata
struct TaskDescriptor {
    id: u64,
    label: String,
    submitted_at: Instant,
    work: TaskFn,
}

/// What happened to a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Task is queued and will run
    Queued { task_id: u64 },
    /// Task is queued; the oldest pending task was shed to make room
    ReplacedOldest { task_id: u64 },
    /// The queue was full and the submission was refused
    Rejected,
}

impl SubmitOutcome {
    /// Whether the task was taken at all
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Counter snapshot for stats endpoints and tests
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub retries: u64,
    pub queued: usize,
    pub in_flight: usize,
}

/// Worker pool draining a bounded task queue
pub struct TaskRunner {
    config: TasksConfig,
    queue: Mutex<VecDeque<TaskDescriptor>>,
    notify: Notify,
    cancel: CancellationToken,
    next_id: AtomicU64,
    in_flight: AtomicUsize,

    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Create the runner and spawn its workers
    pub fn new(config: TasksConfig) -> Arc<Self> {
        let runner = Arc::new(Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for worker_id in 0..runner.config.workers {
            let runner_ref = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                runner_ref.worker_loop(worker_id).await;
            }));
        }
        *runner.workers.lock() = handles;

        runner
    }

    /// Enqueue background work without waiting for it
    ///
    /// `work` is a constructor so each retry gets a fresh future. The call
    /// is a bounded, synchronous queue operation; it never blocks the
    /// caller on queue pressure.
    pub fn submit<F, Fut>(&self, label: &str, work: F) -> SubmitOutcome
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Rejected;
        }

        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let descriptor = TaskDescriptor {
            id: task_id,
            label: label.to_string(),
            submitted_at: Instant::now(),
            work: Arc::new(move || Box::pin(work()) as TaskFuture),
        };

        let outcome = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.queue_capacity {
                match self.config.overflow {
                    OverflowPolicy::Reject => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        counter!("tasks_rejected").increment(1);
                        warn!(label, capacity = self.config.queue_capacity, "task queue full, submission rejected");
                        return SubmitOutcome::Rejected;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(shed) = queue.pop_front() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            counter!("tasks_dropped").increment(1);
                            warn!(
                                shed_label = %shed.label,
                                shed_task_id = shed.id,
                                "task queue full, oldest pending task shed"
                            );
                        }
                        queue.push_back(descriptor);
                        SubmitOutcome::ReplacedOldest { task_id }
                    }
                }
            } else {
                queue.push_back(descriptor);
                SubmitOutcome::Queued { task_id }
            }
        };

        self.submitted.fetch_add(1, Ordering::Relaxed);
        counter!("tasks_submitted").increment(1);
        gauge!("tasks_queued").set(self.queue.lock().len() as f64);
        self.notify.notify_one();
        outcome
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker_id, "task worker started");
        loop {
            // Pop and the in-flight increment happen under one lock so
            // drain() can never observe an empty queue with a task in hand.
            let task = {
                let mut queue = self.queue.lock();
                let task = queue.pop_front();
                if task.is_some() {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                }
                task
            };
            match task {
                Some(task) => {
                    self.run_task(task).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        debug!(worker_id, "task worker stopped");
    }

    /// Run one task to completion, retrying per the configured budget.
    /// A task that exhausts its budget is recorded and dropped; its error
    /// never goes anywhere else.
    async fn run_task(&self, task: TaskDescriptor) {
        let wait = task.submitted_at.elapsed();
        debug!(label = %task.label, task_id = task.id, wait_ms = wait.as_millis() as u64, "task started");

        for attempt in 1..=self.config.max_attempts.max(1) {
            match (task.work)().await {
                Ok(()) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    counter!("tasks_completed").increment(1);
                    return;
                }
                Err(err) if attempt < self.config.max_attempts && err.is_retryable() => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    counter!("tasks_retried").increment(1);
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        label = %task.label,
                        task_id = task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed, will retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.failed.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("tasks_failed").increment(1);
                    warn!(
                        label = %task.label,
                        task_id = task.id,
                        attempts = attempt,
                        error = %err,
                        "task dropped after exhausting retries"
                    );
                    return;
                }
            }
        }
    }

    /// Wait until the queue is empty and no task is mid-run
    ///
    /// For tests and graceful shutdown; new submissions during the wait
    /// extend it.
    pub async fn drain(&self, timeout: Duration) -> PipelineResult<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let quiescent =
                self.queue.lock().is_empty() && self.in_flight.load(Ordering::SeqCst) == 0;
            if quiescent {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(PipelineError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Stop the workers; pending tasks are left unprocessed
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> TaskStats {
        TaskStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            queued: self.queue.lock().len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}
