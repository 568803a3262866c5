//! DashScope image generation client.
//!
//! One request per task. The backend either answers with a result URL
//! directly or with an asynchronous `task_id`, which is polled at the task
//! endpoint until it succeeds, fails, is canceled, or the poll timeout runs
//! out. Successful artifacts are downloaded under the output root.

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::files::{
    artifact_filename, artifact_tag, encode_image_id, ensure_category_dir, guess_extension,
    image_urls, relative_to,
};
use crate::config::BackendSettings;
use crate::error::BackendError;
use crate::scheduler::job::ServiceKind;
use crate::scheduler::task::{Task, TaskOutcome, TaskProcessor};

const MIN_PIXELS: u64 = 512 * 512;
const MAX_PIXELS: u64 = 2048 * 2048;
const DEFAULT_SIZE: &str = "1024*1024";

#[derive(Debug, Serialize)]
struct ContentPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
struct Input<'a> {
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Parameters<'a> {
    size: String,
    prompt_extend: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    watermark: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    seed: u32,
    temperature: f64,
    top_p: f64,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    input: Input<'a>,
    parameters: Parameters<'a>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    #[serde(default)]
    output: Value,
}

/// Accepts `W*H` sizes whose area lies in the supported range.
fn z_image_size(size: &str) -> String {
    let parsed = size.to_lowercase().split_once('*').and_then(|(w, h)| {
        let w: u64 = w.trim().parse().ok()?;
        let h: u64 = h.trim().parse().ok()?;
        (w > 0 && h > 0 && (MIN_PIXELS..=MAX_PIXELS).contains(&(w * h)))
            .then(|| format!("{}*{}", w, h))
    });
    parsed.unwrap_or_else(|| DEFAULT_SIZE.to_string())
}

fn model_or<'a>(requested: &'a str, configured: &'a str) -> &'a str {
    if requested.is_empty() {
        configured
    } else {
        requested
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

/// A string field, or the `url` of an object-valued field.
fn url_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    let value = obj.get(key)?;
    non_empty_str(value).or_else(|| value.get("url").and_then(non_empty_str))
}

/// First artifact URL in a synchronous response's `output`.
///
/// Looks at `output.results[0]` first, then at the content parts of
/// `output.choices[0].message`.
pub fn extract_result_url(output: &Value) -> Option<String> {
    if let Some(first) = output.get("results").and_then(|r| r.get(0)) {
        for key in ["url", "image", "video_url", "video"] {
            if let Some(url) = url_field(first, key) {
                return Some(url.to_string());
            }
        }
    }

    let parts = output
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_array()?;
    parts.iter().find_map(|part| {
        ["image", "image_url", "url", "video_url", "video"]
            .iter()
            .find_map(|key| url_field(part, key))
            .map(str::to_string)
    })
}

/// Result URL of a finished asynchronous task.
fn task_result_url(output: &Value) -> Option<String> {
    output
        .get("results")
        .and_then(|r| r.get(0))
        .and_then(|first| url_field(first, "url").or_else(|| url_field(first, "video_url")))
        .or_else(|| url_field(output, "video_url"))
        .map(str::to_string)
}

/// [`TaskProcessor`] for the Wan and Z-Image services.
pub struct DashScopeProcessor {
    http_client: Client,
    settings: BackendSettings,
}

impl DashScopeProcessor {
    pub fn new(settings: BackendSettings) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http_client,
            settings,
        })
    }

    fn api_key<'a>(
        &'a self,
        specific: Option<&'a String>,
        service: ServiceKind,
    ) -> Result<&'a str, BackendError> {
        specific
            .or(self.settings.api_key.as_ref())
            .map(String::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BackendError::MissingApiKey(service.to_string()))
    }

    fn build_request<'a>(
        &'a self,
        task: &'a Task,
    ) -> Result<(&'a str, GenerationRequest<'a>), BackendError> {
        let prompt = task.prompt.positive.as_str();
        let requested = task.model.trim();
        let input = Input {
            messages: vec![Message {
                role: "user",
                content: vec![ContentPart { text: prompt }],
            }],
        };

        match task.service {
            ServiceKind::Wan => Ok((
                self.settings.wan_endpoint.as_str(),
                GenerationRequest {
                    model: model_or(requested, &self.settings.wan_model),
                    input,
                    parameters: Parameters {
                        size: task.size.clone(),
                        prompt_extend: true,
                        n: Some(1),
                        watermark: Some(false),
                        negative_prompt: Some(task.prompt.negative.as_str())
                            .filter(|n| !n.trim().is_empty()),
                        seed: task.sampling.seed,
                        temperature: task.sampling.temperature,
                        top_p: task.sampling.top_p,
                    },
                },
            )),
            ServiceKind::ZImage => Ok((
                self.settings.z_image_endpoint.as_str(),
                GenerationRequest {
                    model: model_or(requested, &self.settings.z_image_model),
                    input,
                    parameters: Parameters {
                        size: z_image_size(&task.size),
                        prompt_extend: false,
                        n: None,
                        watermark: None,
                        negative_prompt: None,
                        seed: task.sampling.seed,
                        temperature: task.sampling.temperature,
                        top_p: task.sampling.top_p,
                    },
                },
            )),
            ServiceKind::Text => Err(BackendError::MissingEndpoint(task.service.to_string())),
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(BackendError::Api {
                code: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::UnexpectedResponse(e.to_string()))
    }

    /// Polls `task_id` until it reaches a final state.
    async fn wait_for_task(&self, task_id: &str, api_key: &str) -> Result<String, BackendError> {
        let url = format!("{}/{}", self.settings.task_endpoint.trim_end_matches('/'), task_id);
        let started = Instant::now();
        let timeout = self.settings.poll_timeout();

        while started.elapsed() < timeout {
            let response = self
                .http_client
                .get(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .send()
                .await
                .map_err(|e| BackendError::RequestFailed(e.to_string()))?;
            let body: TaskStatusResponse = serde_json::from_value(Self::read_json(response).await?)
                .map_err(|e| BackendError::UnexpectedResponse(e.to_string()))?;

            let status = body
                .output
                .get("task_status")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN");
            match status {
                "SUCCEEDED" => {
                    return task_result_url(&body.output).ok_or_else(|| {
                        BackendError::UnexpectedResponse(format!(
                            "task '{}' succeeded without a result url",
                            task_id
                        ))
                    })
                }
                "FAILED" | "CANCELED" => {
                    return Err(BackendError::RemoteTaskFailed {
                        task_id: task_id.to_string(),
                        status: status.to_string(),
                        message: body
                            .output
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                }
                _ => {
                    debug!(task_id = %task_id, status = %status, "Remote task pending");
                    tokio::time::sleep(self.settings.poll_interval()).await;
                }
            }
        }

        warn!(task_id = %task_id, timeout_secs = timeout.as_secs(), "Remote task timed out");
        Err(BackendError::Timeout(task_id.to_string()))
    }

    /// Downloads `url` into the task's category directory.
    async fn download(&self, url: &str, task: &Task) -> Result<PathBuf, BackendError> {
        let download_err = |reason: String| BackendError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_err(format!("HTTP {}", response.status().as_u16())));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_err(e.to_string()))?;

        let dir = ensure_category_dir(&self.settings.output_dir, &task.category).await?;
        let filename = artifact_filename(
            task.service.artifact_prefix(),
            Local::now(),
            &artifact_tag(task.index),
            &task.resolution,
            &guess_extension(url, content_type.as_deref()),
        );
        let path = dir.join(filename);
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

#[async_trait]
impl TaskProcessor for DashScopeProcessor {
    async fn process(&self, task: &Task) -> Result<TaskOutcome, BackendError> {
        let (endpoint, request) = self.build_request(task)?;
        if endpoint.trim().is_empty() {
            return Err(BackendError::MissingEndpoint(task.service.to_string()));
        }
        let specific = match task.service {
            ServiceKind::Wan => self.settings.wan_api_key.as_ref(),
            ServiceKind::ZImage => self.settings.z_image_api_key.as_ref(),
            ServiceKind::Text => None,
        };
        let api_key = self.api_key(specific, task.service)?;

        debug!(
            service = %task.service,
            model = %request.model,
            seed = task.sampling.seed,
            "Submitting generation request"
        );
        let response = self
            .http_client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;
        let body = Self::read_json(response).await?;
        let output = body.get("output").cloned().unwrap_or(Value::Null);

        // Remote tasks are polled with the shared key.
        let remote_url = match output.get("task_id").and_then(non_empty_str) {
            Some(task_id) => {
                let poll_key = self.api_key(None, task.service).unwrap_or(api_key);
                self.wait_for_task(task_id, poll_key).await?
            }
            None => extract_result_url(&output).ok_or_else(|| {
                BackendError::UnexpectedResponse("response carries no result url".to_string())
            })?,
        };

        let saved_path = self.download(&remote_url, task).await?;
        info!(
            service = %task.service,
            index = task.index,
            path = %saved_path.display(),
            "Artifact saved"
        );

        let outcome = match relative_to(&self.settings.output_dir, &saved_path) {
            Some(rel) => {
                let (thumb, raw) = image_urls(&encode_image_id(&rel));
                TaskOutcome::Success {
                    url: thumb,
                    original_url: Some(raw),
                    saved_path: Some(saved_path),
                }
            }
            None => TaskOutcome::Success {
                url: remote_url,
                original_url: None,
                saved_path: Some(saved_path),
            },
        };
        Ok(outcome)
    }
}
