//! Fixed-capacity execution pools.
//!
//! Two pools bound how many tasks run at once: one for image backends and a
//! default pool for everything else. Each pool is a semaphore; a task holds
//! one permit for the whole backend round trip.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::config::PoolSettings;
use crate::metrics::MetricsCollector;

use super::job::ServiceKind;
use super::store::JobTable;
use super::task::{Task, TaskOutcome, TaskProcessor};

/// Which pool a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Default,
    Image,
}

impl PoolKind {
    pub fn for_service(service: ServiceKind) -> Self {
        if service.is_image() {
            PoolKind::Image
        } else {
            PoolKind::Default
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Default => "default",
            PoolKind::Image => "image",
        }
    }
}

/// Counts a task as finished when dropped.
///
/// The guard is moved into the task's future before it is spawned, so the
/// counter moves on success, on a backend error, on a panic inside the
/// processor, and if the future is dropped without ever running.
pub struct CompletionGuard {
    table: Arc<JobTable>,
    job_id: String,
}

impl CompletionGuard {
    pub fn new(table: Arc<JobTable>, job_id: impl Into<String>) -> Self {
        Self {
            table,
            job_id: job_id.into(),
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.table.increment_completed(&self.job_id);
    }
}

struct ActiveSlot {
    pool: PoolKind,
    metrics: MetricsCollector,
}

impl ActiveSlot {
    fn enter(pool: PoolKind, metrics: MetricsCollector) -> Self {
        metrics.pool_task_started(pool.as_str());
        Self { pool, metrics }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.metrics.pool_task_finished(self.pool.as_str());
    }
}

/// Runs one task through its processor, converting errors to failures.
pub async fn run_task(
    job_id: &str,
    task: &Task,
    processor: &dyn TaskProcessor,
    metrics: MetricsCollector,
) -> TaskOutcome {
    let started = Instant::now();
    let outcome: TaskOutcome = processor.process(task).await.into();
    let elapsed = started.elapsed();

    match &outcome {
        TaskOutcome::Success { url, .. } => {
            debug!(job_id = %job_id, index = task.index, url = %url, "Task succeeded");
            metrics.record_task("success", &task.service.to_string(), elapsed);
        }
        TaskOutcome::Failure { reason } => {
            warn!(job_id = %job_id, index = task.index, reason = %reason, "Task failed");
            metrics.record_task("failure", &task.service.to_string(), elapsed);
        }
    }

    outcome
}

/// Resolves a spawned task's handle, turning a panic into a failure outcome.
pub async fn join_outcome(job_id: &str, index: usize, handle: JoinHandle<TaskOutcome>) -> TaskOutcome {
    handle
        .await
        .unwrap_or_else(|e| panicked_outcome(job_id, index, e))
}

fn panicked_outcome(job_id: &str, index: usize, err: JoinError) -> TaskOutcome {
    warn!(job_id = %job_id, index = index, error = %err, "Task aborted");
    TaskOutcome::failure(format!("task aborted: {}", err))
}

/// The two execution pools.
#[derive(Debug, Clone)]
pub struct ExecutionPools {
    default: Arc<Semaphore>,
    image: Arc<Semaphore>,
    default_size: usize,
    image_size: usize,
    metrics: MetricsCollector,
}

impl ExecutionPools {
    pub fn new(default_workers: usize, image_workers: usize) -> Self {
        Self {
            default: Arc::new(Semaphore::new(default_workers)),
            image: Arc::new(Semaphore::new(image_workers)),
            default_size: default_workers,
            image_size: image_workers,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self::new(settings.default_workers, settings.image_workers)
    }

    fn semaphore(&self, kind: PoolKind) -> Arc<Semaphore> {
        match kind {
            PoolKind::Default => Arc::clone(&self.default),
            PoolKind::Image => Arc::clone(&self.image),
        }
    }

    pub fn capacity(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Default => self.default_size,
            PoolKind::Image => self.image_size,
        }
    }

    /// Permits currently free in `kind`.
    pub fn available(&self, kind: PoolKind) -> usize {
        self.semaphore(kind).available_permits()
    }

    /// Spawns `task` on the pool matching its service.
    ///
    /// The task waits for a permit inside the spawned future; the caller
    /// gets a handle immediately.
    pub fn spawn(
        &self,
        job_id: &str,
        task: Task,
        processor: Arc<dyn TaskProcessor>,
        guard: CompletionGuard,
    ) -> JoinHandle<TaskOutcome> {
        let kind = PoolKind::for_service(task.service);
        let semaphore = self.semaphore(kind);
        let metrics = self.metrics;
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return TaskOutcome::failure("execution pool closed"),
            };
            let _slot = ActiveSlot::enter(kind, metrics);
            run_task(&job_id, &task, processor.as_ref(), metrics).await
        })
    }
}
