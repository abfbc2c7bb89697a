//! Bounded worker pool for ingest tasks.
//!
//! Tasks drain from a shared queue into a fixed number of worker
//! threads. Each task runs under a task-scoped deadline and a shared
//! cancellation token, both checked cooperatively at the driver's
//! suspension points (page fetch, transaction open, sink emit); a
//! cancelled task never produces partial writes because every mutation
//! is wrapped in one transaction per sub-batch.
//!
//! Transient failures retry with exponential backoff until the deadline;
//! permanent failures surface immediately. Committed sub-batches are
//! checkpointed, so a retried task resumes from the first unapplied one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use super::driver::{IngestDriver, TaskOutcome};
use super::errors::IngestError;
use super::task::IngestTask;

/// Shared cooperative cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observed at the next suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation scope for one task attempt.
#[derive(Clone, Debug)]
pub struct TaskContext {
    deadline_at: Option<Instant>,
    limit_secs: u64,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Creates a context expiring `limit` from now.
    #[must_use]
    pub fn new(limit: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline_at: Some(Instant::now() + limit),
            limit_secs: limit.as_secs(),
            cancel,
        }
    }

    /// Creates a context with an absolute expiry, for retry loops that
    /// share one deadline across attempts.
    #[must_use]
    pub fn with_deadline_at(deadline_at: Instant, limit_secs: u64, cancel: CancellationToken) -> Self {
        Self {
            deadline_at: Some(deadline_at),
            limit_secs,
            cancel,
        }
    }

    /// Creates a context with no deadline, for tests.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            deadline_at: None,
            limit_secs: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Fails when the task should stop: cancelled or past deadline.
    pub fn check(&self) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if let Some(deadline_at) = self.deadline_at {
            if Instant::now() >= deadline_at {
                return Err(IngestError::DeadlineExceeded {
                    limit_secs: self.limit_secs,
                });
            }
        }
        Ok(())
    }

    /// Remaining time before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline_at
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Runs `tasks` across the driver's configured worker pool.
///
/// Results come back in task order. Each task retries transient errors
/// with exponential backoff inside its deadline; a task that keeps
/// failing reports its last error.
pub fn run_ingest_tasks(
    driver: &IngestDriver<'_>,
    tasks: Vec<IngestTask>,
    cancel: &CancellationToken,
) -> Vec<Result<TaskOutcome, IngestError>> {
    let worker_count = driver.limits.worker_count.min(tasks.len()).max(1);

    let queue = ArrayQueue::new(tasks.len().max(1));
    for (index, task) in tasks.iter().enumerate() {
        queue
            .push((index, task))
            .unwrap_or_else(|_| unreachable!("queue sized to task count"));
    }

    let results: Mutex<Vec<Option<Result<TaskOutcome, IngestError>>>> =
        Mutex::new((0..tasks.len()).map(|_| None).collect());

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| {
                while let Some((index, task)) = queue.pop() {
                    let result = run_one_task(driver, task, cancel);
                    results.lock().expect("results lock poisoned")[index] = Some(result);
                    if cancel.is_cancelled() {
                        // Drain nothing further; queued tasks report as
                        // cancelled below.
                        break;
                    }
                }
            });
        }
    });

    // Tasks never popped (cancellation mid-run) report as cancelled.
    results
        .into_inner()
        .expect("results lock poisoned")
        .into_iter()
        .map(|entry| entry.unwrap_or(Err(IngestError::Cancelled)))
        .collect()
}

/// Runs one task with transient-error retry under a shared deadline.
fn run_one_task(
    driver: &IngestDriver<'_>,
    task: &IngestTask,
    cancel: &CancellationToken,
) -> Result<TaskOutcome, IngestError> {
    let limit = Duration::from_secs(driver.limits.task_deadline_secs);
    let deadline_at = Instant::now() + limit;
    let mut backoff = Duration::from_millis(driver.limits.backoff_base_ms);
    let backoff_cap = Duration::from_millis(driver.limits.backoff_cap_ms);

    loop {
        let ctx = TaskContext::with_deadline_at(
            deadline_at,
            driver.limits.task_deadline_secs,
            cancel.clone(),
        );
        match driver.run_task(task, &ctx) {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_permanent() => return Err(err),
            Err(err @ IngestError::Cancelled) => return Err(err),
            Err(err) => {
                // Transient: retry with backoff if the deadline allows
                // another attempt.
                if Instant::now() + backoff >= deadline_at {
                    return Err(err);
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(backoff_cap);
            }
        }
    }
}
