//! Error types for image-forge operations.
//!
//! Errors shared across subsystems live here:
//! - Generation backend calls (submission, polling, download)
//! - Prompt refinement over the chat-completion API
//!
//! Subsystem-local errors (journal, storage, scheduler, config) are defined
//! beside the code that raises them.

use thiserror::Error;

/// Errors that can occur while talking to a generation backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Missing API key for backend '{0}'")]
    MissingApiKey(String),

    #[error("No endpoint configured for backend '{0}'")]
    MissingEndpoint(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Backend returned error (HTTP {code}): {message}")]
    Api { code: u16, message: String },

    #[error("Unrecognized backend response: {0}")]
    UnexpectedResponse(String),

    #[error("Remote task '{task_id}' ended with status {status}: {message}")]
    RemoteTaskFailed {
        task_id: String,
        status: String,
        message: String,
    },

    #[error("Remote task '{0}' did not finish before the poll timeout")]
    Timeout(String),

    #[error("Download failed for '{url}': {reason}")]
    Download { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Short reason string recorded in a task's failure outcome.
    pub fn reason(&self) -> String {
        match self {
            BackendError::Timeout(_) => "timeout".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors that can occur during prompt refinement.
#[derive(Debug, Error)]
pub enum RefineError {
    #[error("Missing API key for prompt refinement")]
    MissingApiKey,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("API error (HTTP {code}): {message}")]
    Api { code: u16, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Failed to parse refinement output: {0}")]
    Parse(String),

    #[error("Refinement returned an empty {0} prompt")]
    EmptyPrompt(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_reason_is_stable() {
        let err = BackendError::Timeout("task-1".to_string());
        assert_eq!(err.reason(), "timeout");
    }

    #[test]
    fn test_api_error_display() {
        let err = BackendError::Api {
            code: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.reason(), "Backend returned error (HTTP 500): boom");
    }
}
