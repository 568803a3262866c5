//! In-process job lifecycle engine.
//!
//! - **JobDispatcher**: FIFO job queue drained by one consumer task
//! - **TaskGenerator / TaskProcessor**: the seams a job is built from
//! - **ExecutionPools**: bounded fan-out for parallel jobs
//! - **JobTable**: status and progress of every submitted job
//! - **CompletionSink**: receives the summary of each completed job
//!
//! # Lifecycle
//!
//! ```text
//!   submit ──► submitted ──► processing ──► running ──► completed
//!                                │
//!                                └──► failed (generation error / no tasks)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_forge::scheduler::{JobContext, JobDispatcher, ServiceKind};
//! use std::sync::Arc;
//!
//! let dispatcher = JobDispatcher::from_config(&config).with_sink(sink);
//! dispatcher.start().await?;
//!
//! let ctx = JobContext::new("a red fox in snow", ServiceKind::Wan, 4)
//!     .with_category("animals");
//! dispatcher.submit("job-1", ctx, generator.clone(), processor.clone())?;
//!
//! let snapshot = dispatcher.poll("job-1");
//! dispatcher.stop().await?;
//! ```

pub mod completion;
pub mod dispatcher;
pub mod generator;
pub mod job;
pub mod pools;
pub mod store;
pub mod task;

pub use completion::{assemble_entry, CompletionSink, LedgerSink, SinkError};
pub use dispatcher::{DispatchError, JobDispatcher};
pub use generator::RefiningTaskGenerator;
pub use job::{
    hour_bucket, is_hour_bucket, JobContext, JobSnapshot, JobStatus, Progress, ServiceKind,
    UNKNOWN_ID,
};
pub use pools::{CompletionGuard, ExecutionPools, PoolKind};
pub use store::JobTable;
pub use task::{
    GenerationError, RefinedPrompt, SamplingParams, Task, TaskGenerator, TaskOutcome,
    TaskProcessor,
};
