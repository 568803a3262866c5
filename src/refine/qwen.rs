//! Refiner backed by an OpenAI-compatible chat-completions endpoint
//! (DashScope compatible mode by default).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::cache::RefineCache;
use super::extract::parse_refined;
use super::{PromptRefiner, RefineRequest};
use crate::config::BackendSettings;
use crate::error::RefineError;
use crate::scheduler::task::RefinedPrompt;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

const OUTPUT_FORMAT: &str = r#"Output Format (Strict JSON):
{
  "positive_prompt": "...",
  "negative_prompt": "...",
  "positive_prompt_zh": "...",
  "negative_prompt_zh": "..."
}"#;

fn refine_instruction(req: &RefineRequest) -> String {
    format!(
        "{role}\n\nInput Data:\n- Category: {category}\n- User Prompt: {prompt}\n- Preferred Style: {style}\n- Default Negative Prompt: {negative}\n\nTask:\n1. Analyze the User Prompt and Category.\n2. Expand it into a rich, detailed English prompt (Positive Prompt) incorporating the Preferred Style if appropriate.\n3. Create a strong Negative Prompt to ensure quality.\n4. Also give Chinese translations of both prompts.\n\n{format}",
        role = req.role,
        category = req.category,
        prompt = req.prompt,
        style = req.style,
        negative = req.negative,
        format = OUTPUT_FORMAT,
    )
}

fn delta_instruction(base_positive: &str, req: &RefineRequest, ratio: f64) -> String {
    let percent = (ratio.clamp(0.0, 1.0) * 100.0).round() as u32;
    format!(
        "{role}\n\nInput Data:\n- Category: {category}\n- Base Prompt: {base}\n- Preferred Style: {style}\n- Default Negative Prompt: {negative}\n\nTask:\n1. Write a variation of the Base Prompt that changes about {percent}% of its details (composition, lighting, secondary elements).\n2. Keep the main subject, the category and the style unchanged.\n3. Create a matching Negative Prompt.\n4. Also give Chinese translations of both prompts.\n\n{format}",
        role = req.role,
        category = req.category,
        base = base_positive,
        style = req.style,
        negative = req.negative,
        percent = percent,
        format = OUTPUT_FORMAT,
    )
}

/// Chat-completions refiner with a one-hour result cache for `refine`.
pub struct QwenRefiner {
    http_client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    cache: Arc<RefineCache>,
}

impl QwenRefiner {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http_client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            cache: Arc::new(RefineCache::default()),
        }
    }

    /// Builds a refiner from backend settings, honouring the request timeout.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, RefineError> {
        let http_client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| RefineError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http_client,
            endpoint: settings.chat_endpoint.clone(),
            model: settings.refine_model.clone(),
            api_key: settings.api_key.clone(),
            cache: Arc::new(RefineCache::default()),
        })
    }

    pub fn with_cache(mut self, cache: Arc<RefineCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &RefineCache {
        &self.cache
    }

    /// Sends one user message and returns the first choice's text.
    async fn chat(&self, content: &str) -> Result<String, RefineError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(RefineError::MissingApiKey)?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RefineError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            if code == 429 {
                return Err(RefineError::RateLimited(message));
            }
            return Err(RefineError::Api { code, message });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RefineError::Parse(format!("Failed to parse API response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RefineError::Parse("response has no choices".to_string()))
    }
}

#[async_trait]
impl PromptRefiner for QwenRefiner {
    async fn refine(&self, request: &RefineRequest) -> Result<RefinedPrompt, RefineError> {
        if let Some(hit) = self.cache.get(request) {
            debug!(prompt = %request.prompt, "Refine cache hit");
            return Ok(hit);
        }

        let reply = self.chat(&refine_instruction(request)).await?;
        let refined = parse_refined(&reply)?;
        info!(
            model = %self.model,
            category = %request.category,
            positive_len = refined.positive.len(),
            "Refined prompt"
        );
        self.cache.insert(request.clone(), refined.clone());
        Ok(refined)
    }

    async fn refine_delta(
        &self,
        base_positive: &str,
        request: &RefineRequest,
        ratio: f64,
    ) -> Result<RefinedPrompt, RefineError> {
        let reply = self
            .chat(&delta_instruction(base_positive, request, ratio))
            .await?;
        let refined = parse_refined(&reply)?;
        debug!(ratio = ratio, positive_len = refined.positive.len(), "Derived prompt variation");
        Ok(refined)
    }
}
