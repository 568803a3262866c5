//! Prompt refinement over a chat-completion model.
//!
//! A refiner turns a short user prompt into a detailed positive prompt and a
//! matching negative prompt. `refine_delta` derives a close variation of an
//! already-refined prompt; serial jobs chain it task to task.

pub mod cache;
pub mod extract;
pub mod qwen;

pub use cache::RefineCache;
pub use extract::{extract_json_object, parse_refined};
pub use qwen::QwenRefiner;

use async_trait::async_trait;

use crate::error::RefineError;
use crate::scheduler::task::RefinedPrompt;

/// Inputs of one refinement call. Also the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefineRequest {
    pub prompt: String,
    pub category: String,
    pub style: String,
    pub negative: String,
    pub role: String,
}

impl RefineRequest {
    pub fn new(prompt: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            category: category.into(),
            style: String::new(),
            negative: String::new(),
            role: String::new(),
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn with_negative(mut self, negative: impl Into<String>) -> Self {
        self.negative = negative.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// Turns user prompts into model-ready prompt pairs.
#[async_trait]
pub trait PromptRefiner: Send + Sync {
    /// Expands `request.prompt` into a detailed positive/negative pair.
    async fn refine(&self, request: &RefineRequest) -> Result<RefinedPrompt, RefineError>;

    /// Produces a variation of `base_positive` that changes roughly
    /// `ratio` of its details and keeps the subject and style.
    async fn refine_delta(
        &self,
        base_positive: &str,
        request: &RefineRequest,
        ratio: f64,
    ) -> Result<RefinedPrompt, RefineError>;
}
