//! Job definitions for the dispatcher.
//!
//! - `JobContext`: the caller's request, carried unchanged through a job's life
//! - `JobStatus`: lifecycle state of a job
//! - `JobSnapshot`: what `poll` hands back to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskOutcome;

/// Namespace for session ids derived from `{user}:{job_id}`.
const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b811_9dad_11d1_80b4_00c04fd430c8);

/// Placeholder stored when a user or session id is unknown.
pub const UNKNOWN_ID: &str = "-1";

/// Current UTC hour as a `YYYYMMDDHH` bucket.
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H").to_string()
}

/// Returns true if `value` is a well-formed `YYYYMMDDHH` bucket.
pub fn is_hour_bucket(value: &str) -> bool {
    value.len() == 10 && value.bytes().all(|b| b.is_ascii_digit())
}

/// Which backend family a job targets. Image families run on the image pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Wan,
    ZImage,
    Text,
}

impl ServiceKind {
    pub fn is_image(self) -> bool {
        matches!(self, ServiceKind::Wan | ServiceKind::ZImage)
    }

    /// Filename prefix for artifacts produced by this service.
    pub fn artifact_prefix(self) -> &'static str {
        match self {
            ServiceKind::Wan => "wan",
            ServiceKind::ZImage => "z_image",
            ServiceKind::Text => "result",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Wan => write!(f, "wan"),
            ServiceKind::ZImage => write!(f, "z_image"),
            ServiceKind::Text => write!(f, "text"),
        }
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "wan" | "wan_image" => Ok(ServiceKind::Wan),
            "z_image" | "zimage" => Ok(ServiceKind::ZImage),
            "text" | "qwen" => Ok(ServiceKind::Text),
            other => Err(format!("unknown service '{}'", other)),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Registered and waiting in the dispatch queue.
    Submitted,
    /// Generation phase running (prompt refinement, sampling).
    Processing,
    /// Tasks dispatched.
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The caller's generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub user_id: String,
    pub session_id: String,
    /// `YYYYMMDDHH` UTC bucket the job was created in.
    pub created_at: String,
    /// Base prompt as typed by the user.
    pub prompt: String,
    /// Overrides the configured default negative prompt.
    pub negative_prompt: Option<String>,
    pub category: String,
    pub style: Option<String>,
    pub service: ServiceKind,
    /// Model name; empty means the backend's configured default.
    pub model: String,
    pub aspect_ratio: String,
    /// Quality label, e.g. `1K` or `1080p`.
    pub resolution: String,
    /// Backend size string, e.g. `1024*1024`.
    pub size: String,
    /// Number of artifacts requested.
    pub count: usize,
}

impl JobContext {
    /// Creates a context for `count` artifacts of `prompt` on `service`.
    pub fn new(prompt: impl Into<String>, service: ServiceKind, count: usize) -> Self {
        Self {
            user_id: UNKNOWN_ID.to_string(),
            session_id: UNKNOWN_ID.to_string(),
            created_at: hour_bucket(Utc::now()),
            prompt: prompt.into(),
            negative_prompt: None,
            category: "default".to_string(),
            style: None,
            service,
            model: String::new(),
            aspect_ratio: "16:9".to_string(),
            resolution: "1K".to_string(),
            size: "1024*1024".to_string(),
            count,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = ratio.into();
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    pub fn with_created_at(mut self, bucket: impl Into<String>) -> Self {
        self.created_at = bucket.into();
        self
    }

    /// Deterministic session id for a user's job.
    pub fn derive_session_id(user_id: &str, job_id: &str) -> String {
        Uuid::new_v5(&SESSION_NAMESPACE, format!("{}:{}", user_id, job_id).as_bytes()).to_string()
    }
}

/// Progress counters reported by `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub percent: u8,
}

impl Progress {
    pub fn new(total: usize, completed: usize) -> Self {
        let percent = if total == 0 {
            0
        } else {
            ((completed.min(total) * 100) / total) as u8
        };
        Self {
            total,
            completed,
            percent,
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    /// True once the job reached a terminal state.
    pub ready: bool,
    pub progress: Progress,
    /// Per-task outcomes in task-index order. Empty until the job finishes.
    pub results: Vec<TaskOutcome>,
    /// Every status the job has passed through, oldest first.
    pub history: Vec<JobStatus>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_progress_percent_floors() {
        assert_eq!(Progress::new(3, 1).percent, 33);
        assert_eq!(Progress::new(3, 2).percent, 66);
        assert_eq!(Progress::new(3, 3).percent, 100);
        assert_eq!(Progress::new(0, 0).percent, 0);
    }

    #[test]
    fn test_hour_bucket() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(hour_bucket(at), "2025010203");
        assert!(is_hour_bucket("2025010203"));
        assert!(!is_hour_bucket("2025-01-02"));
        assert!(!is_hour_bucket("202501020"));
    }

    #[test]
    fn test_service_kind_parsing() {
        assert_eq!("wan".parse::<ServiceKind>(), Ok(ServiceKind::Wan));
        assert_eq!("Z-Image".parse::<ServiceKind>(), Ok(ServiceKind::ZImage));
        assert!("dalle".parse::<ServiceKind>().is_err());
        assert!(ServiceKind::Wan.is_image());
        assert!(!ServiceKind::Text.is_image());
    }

    #[test]
    fn test_session_id_is_deterministic() {
        let a = JobContext::derive_session_id("u1", "job-1");
        let b = JobContext::derive_session_id("u1", "job-1");
        let c = JobContext::derive_session_id("u2", "job-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert_eq!(JobStatus::Processing.to_string(), "processing");
    }
}
