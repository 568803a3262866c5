//! Tasks, their outcomes, and the two seams a job is built from:
//! a [`TaskGenerator`] that expands a request into tasks and a
//! [`TaskProcessor`] that executes one task against a backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use super::job::{JobContext, ServiceKind};
use crate::error::{BackendError, RefineError};

/// Errors raised during a job's generation phase.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Prompt refinement failed: {0}")]
    Refine(#[from] RefineError),

    #[error("Generator produced no tasks")]
    NoTasks,

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),
}

/// A refined prompt pair, optionally with Chinese renderings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedPrompt {
    pub positive: String,
    pub negative: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive_zh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_zh: Option<String>,
}

impl RefinedPrompt {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
            positive_zh: None,
            negative_zh: None,
        }
    }
}

/// Sampling parameters drawn per task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub seed: u32,
    pub temperature: f64,
    pub top_p: f64,
}

/// One unit of work: a single artifact to generate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub index: usize,
    pub prompt: RefinedPrompt,
    pub sampling: SamplingParams,
    pub service: ServiceKind,
    pub model: String,
    pub category: String,
    pub size: String,
    pub resolution: String,
    /// Set when the prompt was chained from the previous task.
    pub inherited: bool,
    pub delta_ratio: Option<f64>,
}

impl Task {
    /// Replaces this task's prompt with one chained from a sibling.
    pub fn inherit(&mut self, prompt: RefinedPrompt, ratio: f64) {
        self.prompt = prompt;
        self.inherited = true;
        self.delta_ratio = Some(ratio);
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        /// URL handed back to clients (a local thumb URL or the remote URL).
        url: String,
        /// Full-resolution serving URL when the artifact is stored locally.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        saved_path: Option<PathBuf>,
    },
    Failure {
        reason: String,
    },
}

impl TaskOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

impl From<Result<TaskOutcome, BackendError>> for TaskOutcome {
    fn from(result: Result<TaskOutcome, BackendError>) -> Self {
        match result {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::failure(e.reason()),
        }
    }
}

/// Expands a job request into tasks.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    /// Runs the generation phase: refines the base prompt once and draws
    /// sampling parameters for every task.
    async fn generate(&self, ctx: &JobContext) -> Result<Vec<Task>, GenerationError>;

    /// Derives the next prompt in a serial chain from the previous task's
    /// refined prompt.
    async fn chain(
        &self,
        ctx: &JobContext,
        previous: &RefinedPrompt,
        ratio: f64,
    ) -> Result<RefinedPrompt, GenerationError>;
}

/// Executes a single task against a generation backend.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &Task) -> Result<TaskOutcome, BackendError>;
}
