//! The job dispatcher.
//!
//! A single consumer task drains a FIFO queue of submitted jobs. For each
//! job it runs the generation phase to completion, then executes the tasks
//! either as a serial prompt chain (awaited in place) or as a fan-out on the
//! execution pools (awaited by a per-job aggregator, so the dispatcher moves
//! on to the next job while the fan-out runs).

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{ForgeConfig, GenerationSettings};
use crate::metrics::MetricsCollector;

use super::completion::{assemble_entry, CompletionSink};
use super::job::{JobContext, JobSnapshot, JobStatus};
use super::pools::{join_outcome, run_task, CompletionGuard, ExecutionPools};
use super::store::JobTable;
use super::task::{GenerationError, Task, TaskGenerator, TaskOutcome, TaskProcessor};

/// Errors returned by the dispatcher's public operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `start` was called on a running dispatcher.
    #[error("Dispatcher is already running")]
    AlreadyRunning,

    /// The dispatcher is not accepting jobs.
    #[error("Dispatcher is not running")]
    NotRunning,

    /// The job id is blank.
    #[error("Invalid job id: '{0}'")]
    InvalidJobId(String),

    /// The consumer task ended abnormally.
    #[error("Dispatcher task failed: {0}")]
    Task(String),
}

struct QueuedJob {
    job_id: String,
    ctx: JobContext,
    generator: Arc<dyn TaskGenerator>,
    processor: Arc<dyn TaskProcessor>,
    enqueued_at: Instant,
}

/// State shared between the public handle, the consumer and aggregators.
struct Engine {
    table: Arc<JobTable>,
    pools: ExecutionPools,
    settings: GenerationSettings,
    output_dir: PathBuf,
    sink: RwLock<Option<Arc<dyn CompletionSink>>>,
    metrics: MetricsCollector,
}

/// Job dispatcher with explicit `start`/`stop`.
pub struct JobDispatcher {
    engine: Arc<Engine>,
    sender: RwLock<Option<mpsc::UnboundedSender<QueuedJob>>>,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JobDispatcher {
    pub fn new(
        pools: ExecutionPools,
        settings: GenerationSettings,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                table: Arc::new(JobTable::new()),
                pools,
                settings,
                output_dir: output_dir.into(),
                sink: RwLock::new(None),
                metrics: MetricsCollector::new(),
            }),
            sender: RwLock::new(None),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        Self::new(
            ExecutionPools::from_settings(&config.pools),
            config.generation.clone(),
            config.backend.output_dir.clone(),
        )
    }

    /// Sets the sink completed jobs are handed to.
    pub fn with_sink(self, sink: Arc<dyn CompletionSink>) -> Self {
        self.set_sink(sink);
        self
    }

    /// Replaces the sink. Jobs finalized afterwards use the new one.
    pub fn set_sink(&self, sink: Arc<dyn CompletionSink>) {
        *self.engine.sink.write().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    pub fn table(&self) -> Arc<JobTable> {
        Arc::clone(&self.engine.table)
    }

    /// Spawns the consumer task.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.write().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        *consumer = Some(tokio::spawn(run_consumer(rx, Arc::clone(&self.engine))));

        info!(
            inheritance = self.engine.settings.prompt_inheritance,
            "Job dispatcher started"
        );
        Ok(())
    }

    /// Stops accepting jobs, then waits until every queued job has been
    /// processed and every in-flight fan-out has been finalized.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let handle = self.consumer.lock().await.take();
        self.sender
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let Some(handle) = handle else {
            return Ok(());
        };
        handle
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))?;
        info!("Job dispatcher stopped");
        Ok(())
    }

    /// Registers `job_id` as submitted and queues it. Returns immediately.
    pub fn submit(
        &self,
        job_id: &str,
        ctx: JobContext,
        generator: Arc<dyn TaskGenerator>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), DispatchError> {
        if job_id.trim().is_empty() {
            return Err(DispatchError::InvalidJobId(job_id.to_string()));
        }
        let sender = self
            .sender
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(DispatchError::NotRunning)?;

        self.engine.table.register(job_id, ctx.count);
        let job = QueuedJob {
            job_id: job_id.to_string(),
            ctx,
            generator,
            processor,
            enqueued_at: Instant::now(),
        };
        if sender.send(job).is_err() {
            self.engine.table.finish(
                job_id,
                JobStatus::Failed,
                vec![TaskOutcome::failure("dispatcher stopped")],
            );
            return Err(DispatchError::NotRunning);
        }

        self.engine.metrics.job_enqueued();
        info!(job_id = %job_id, "Job submitted");
        Ok(())
    }

    /// Current state of `job_id`, or `None` if it was never submitted.
    pub fn poll(&self, job_id: &str) -> Option<JobSnapshot> {
        self.engine.table.snapshot(job_id)
    }
}

async fn run_consumer(mut rx: mpsc::UnboundedReceiver<QueuedJob>, engine: Arc<Engine>) {
    let mut aggregators = JoinSet::new();

    while let Some(job) = rx.recv().await {
        engine.metrics.job_dequeued();
        while aggregators.try_join_next().is_some() {}
        Arc::clone(&engine).run_job(job, &mut aggregators).await;
    }

    while let Some(result) = aggregators.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Job aggregator aborted");
        }
    }
}

impl Engine {
    async fn run_job(self: Arc<Self>, job: QueuedJob, aggregators: &mut JoinSet<()>) {
        let QueuedJob {
            job_id,
            ctx,
            generator,
            processor,
            enqueued_at,
        } = job;

        self.table.set_status(&job_id, JobStatus::Processing);
        debug!(
            job_id = %job_id,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "Generation phase started"
        );

        let tasks = match generator.generate(&ctx).await {
            Ok(tasks) if tasks.is_empty() => {
                self.fail(&job_id, &GenerationError::NoTasks);
                return;
            }
            Ok(tasks) => tasks,
            Err(e) => {
                self.fail(&job_id, &e);
                return;
            }
        };

        self.table.start_running(&job_id, tasks.len());
        info!(
            job_id = %job_id,
            tasks = tasks.len(),
            serial = self.settings.prompt_inheritance,
            "Job running"
        );

        if self.settings.prompt_inheritance {
            let (tasks, outcomes) = self
                .run_serial(&job_id, &ctx, tasks, generator.as_ref(), processor)
                .await;
            self.finalize(&job_id, &ctx, &tasks, outcomes).await;
        } else {
            let handles: Vec<JoinHandle<TaskOutcome>> = tasks
                .iter()
                .map(|task| {
                    self.pools.spawn(
                        &job_id,
                        task.clone(),
                        Arc::clone(&processor),
                        CompletionGuard::new(Arc::clone(&self.table), job_id.as_str()),
                    )
                })
                .collect();

            let engine = Arc::clone(&self);
            aggregators.spawn(async move {
                let outcomes = join_all(
                    handles
                        .into_iter()
                        .enumerate()
                        .map(|(index, handle)| join_outcome(&job_id, index, handle)),
                )
                .await;
                engine.finalize(&job_id, &ctx, &tasks, outcomes).await;
            });
        }
    }

    /// Runs tasks one at a time. Task `i > 0` gets a prompt chained from
    /// task `i - 1`'s prompt.
    async fn run_serial(
        &self,
        job_id: &str,
        ctx: &JobContext,
        tasks: Vec<Task>,
        generator: &dyn TaskGenerator,
        processor: Arc<dyn TaskProcessor>,
    ) -> (Vec<Task>, Vec<TaskOutcome>) {
        let ratio = self.settings.prompt_delta_ratio;
        let mut executed = Vec::with_capacity(tasks.len());
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut previous = None;

        for mut task in tasks {
            let guard = CompletionGuard::new(Arc::clone(&self.table), job_id);

            if let Some(prev) = &previous {
                match generator.chain(ctx, prev, ratio).await {
                    Ok(prompt) => task.inherit(prompt, ratio),
                    Err(e) => {
                        warn!(job_id = %job_id, index = task.index, error = %e, "Prompt chain failed");
                        drop(guard);
                        outcomes.push(TaskOutcome::failure(format!("prompt chain failed: {}", e)));
                        executed.push(task);
                        continue;
                    }
                }
            }
            previous = Some(task.prompt.clone());

            let index = task.index;
            let processor = Arc::clone(&processor);
            let metrics = self.metrics;
            let owned_id = job_id.to_string();
            let owned_task = task.clone();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                run_task(&owned_id, &owned_task, processor.as_ref(), metrics).await
            });

            outcomes.push(join_outcome(job_id, index, handle).await);
            executed.push(task);
        }

        (executed, outcomes)
    }

    fn fail(&self, job_id: &str, err: &GenerationError) {
        error!(job_id = %job_id, error = %err, "Generation phase failed");
        self.table.finish(
            job_id,
            JobStatus::Failed,
            vec![TaskOutcome::failure(err.to_string())],
        );
        self.metrics.record_job("failed");
    }

    /// Hands the summary to the sink, then marks the job completed. A sink
    /// failure is logged and does not change the job's status.
    async fn finalize(
        &self,
        job_id: &str,
        ctx: &JobContext,
        tasks: &[Task],
        outcomes: Vec<TaskOutcome>,
    ) {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();

        let sink = self
            .sink
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(sink) = sink {
            let entry = {
                let (job_id, ctx, tasks, outcomes, output_dir) = (
                    job_id.to_string(),
                    ctx.clone(),
                    tasks.to_vec(),
                    outcomes.clone(),
                    self.output_dir.clone(),
                );
                tokio::task::spawn_blocking(move || {
                    assemble_entry(&job_id, &ctx, &tasks, &outcomes, &output_dir)
                })
                .await
            };
            match entry {
                Ok(entry) => {
                    if let Err(e) = sink.complete(&entry).await {
                        error!(job_id = %job_id, error = %e, "Failed to record completed job");
                    }
                }
                Err(e) => error!(job_id = %job_id, error = %e, "Summary assembly aborted"),
            }
        }

        info!(
            job_id = %job_id,
            succeeded = succeeded,
            failed = outcomes.len() - succeeded,
            "Job completed"
        );
        self.table.finish(job_id, JobStatus::Completed, outcomes);
        self.metrics.record_job("completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::scheduler::job::ServiceKind;
    use crate::scheduler::task::{RefinedPrompt, SamplingParams};
    use crate::journal::RecordEntry;
    use crate::scheduler::completion::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed {
        count: Option<usize>,
    }

    #[async_trait]
    impl TaskGenerator for Fixed {
        async fn generate(&self, ctx: &JobContext) -> Result<Vec<Task>, GenerationError> {
            let n = self.count.unwrap_or(ctx.count);
            Ok((0..n)
                .map(|index| Task {
                    index,
                    prompt: RefinedPrompt::new("p", "n"),
                    sampling: SamplingParams {
                        seed: index as u32,
                        temperature: 1.0,
                        top_p: 0.8,
                    },
                    service: ctx.service,
                    model: "m".to_string(),
                    category: ctx.category.clone(),
                    size: ctx.size.clone(),
                    resolution: ctx.resolution.clone(),
                    inherited: false,
                    delta_ratio: None,
                })
                .collect())
        }

        async fn chain(
            &self,
            _ctx: &JobContext,
            previous: &RefinedPrompt,
            _ratio: f64,
        ) -> Result<RefinedPrompt, GenerationError> {
            Ok(RefinedPrompt::new(format!("{}'", previous.positive), "n"))
        }
    }

    struct Ok200;

    #[async_trait]
    impl TaskProcessor for Ok200 {
        async fn process(&self, task: &Task) -> Result<TaskOutcome, BackendError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(TaskOutcome::Success {
                url: format!("https://cdn.example/{}.png", task.prompt.positive),
                original_url: None,
                saved_path: None,
            })
        }
    }

    async fn wait_ready(dispatcher: &JobDispatcher, job_id: &str) -> JobSnapshot {
        for _ in 0..200 {
            if let Some(snap) = dispatcher.poll(job_id) {
                if snap.ready {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", job_id);
    }

    fn dispatcher(serial: bool) -> JobDispatcher {
        let settings = GenerationSettings {
            prompt_inheritance: serial,
            prompt_delta_ratio: 0.2,
            ..GenerationSettings::default()
        };
        JobDispatcher::new(ExecutionPools::new(2, 2), settings, "/tmp/image-forge-test")
    }

    #[tokio::test]
    async fn test_submit_requires_start() {
        let d = dispatcher(false);
        let ctx = JobContext::new("cat", ServiceKind::Wan, 1);
        let result = d.submit("j", ctx, Arc::new(Fixed { count: None }), Arc::new(Ok200));
        assert!(matches!(result, Err(DispatchError::NotRunning)));
        assert!(d.poll("j").is_none());
    }

    #[tokio::test]
    async fn test_empty_task_list_fails_job() {
        let d = dispatcher(false);
        d.start().await.unwrap();
        let ctx = JobContext::new("cat", ServiceKind::Wan, 2);
        d.submit("j", ctx, Arc::new(Fixed { count: Some(0) }), Arc::new(Ok200))
            .unwrap();

        let snap = wait_ready(&d, "j").await;
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.results.len(), 1);
        assert!(!snap.results[0].is_success());
        d.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_serial_chain_prompts() {
        let d = dispatcher(true);
        d.start().await.unwrap();
        let ctx = JobContext::new("cat", ServiceKind::Wan, 3);
        d.submit("j", ctx, Arc::new(Fixed { count: None }), Arc::new(Ok200))
            .unwrap();

        let snap = wait_ready(&d, "j").await;
        assert_eq!(snap.status, JobStatus::Completed);
        let urls: Vec<_> = snap
            .results
            .iter()
            .map(|o| match o {
                TaskOutcome::Success { url, .. } => url.clone(),
                TaskOutcome::Failure { reason } => reason.clone(),
            })
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example/p.png",
                "https://cdn.example/p'.png",
                "https://cdn.example/p''.png"
            ]
        );
        assert_eq!(snap.progress.completed, 3);
        d.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_queued_jobs() {
        let d = dispatcher(false);
        d.start().await.unwrap();
        for i in 0..3 {
            let ctx = JobContext::new("cat", ServiceKind::Wan, 2);
            d.submit(&format!("j{}", i), ctx, Arc::new(Fixed { count: None }), Arc::new(Ok200))
                .unwrap();
        }
        d.stop().await.unwrap();

        for i in 0..3 {
            let snap = d.poll(&format!("j{}", i)).unwrap();
            assert_eq!(snap.status, JobStatus::Completed);
            assert_eq!(snap.progress.percent, 100);
        }
        assert!(matches!(
            d.submit("late", JobContext::new("cat", ServiceKind::Wan, 1), Arc::new(Fixed { count: None }), Arc::new(Ok200)),
            Err(DispatchError::NotRunning)
        ));
    }

    #[derive(Default)]
    struct Counting {
        jobs: AtomicUsize,
    }

    #[async_trait]
    impl CompletionSink for Counting {
        async fn complete(&self, _entry: &RecordEntry) -> Result<(), SinkError> {
            self.jobs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_attached_after_start_is_used() {
        let d = dispatcher(false);
        let _table = d.table();
        d.start().await.unwrap();

        let sink = Arc::new(Counting::default());
        d.set_sink(sink.clone());
        let ctx = JobContext::new("cat", ServiceKind::Wan, 2);
        d.submit("j", ctx, Arc::new(Fixed { count: None }), Arc::new(Ok200))
            .unwrap();
        let snap = wait_ready(&d, "j").await;
        assert_eq!(snap.status, JobStatus::Completed);
        d.stop().await.unwrap();

        assert_eq!(sink.jobs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_sink_applies_to_started_dispatcher() {
        let sink = Arc::new(Counting::default());
        let d = dispatcher(false).with_sink(sink.clone());
        d.start().await.unwrap();
        for i in 0..2 {
            let ctx = JobContext::new("cat", ServiceKind::Wan, 1);
            d.submit(&format!("j{}", i), ctx, Arc::new(Fixed { count: None }), Arc::new(Ok200))
                .unwrap();
        }
        d.stop().await.unwrap();
        assert_eq!(sink.jobs.load(Ordering::SeqCst), 2);
    }
}
