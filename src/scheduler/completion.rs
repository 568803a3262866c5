//! Job summary assembly and the completion sink.
//!
//! When a job finishes, the dispatcher turns its tasks and outcomes into a
//! [`RecordEntry`] and hands it to a [`CompletionSink`]. The standard sink,
//! [`LedgerSink`], writes the entry to the append log and persists it to the
//! relational store under the same content hash that ingestion computes for
//! the logged line.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::files::{
    decode_image_id, encode_image_id, image_id_from_url, image_urls, relative_to,
    safe_dir_name, safe_join, IMAGE_URL_PREFIX,
};
use crate::journal::{content_hash, GeneratedItem, JournalError, RecordEntry, RecordLog};
use crate::storage::{Database, DatabaseError};

use super::job::JobContext;
use super::task::{RefinedPrompt, Task, TaskOutcome};

/// Errors raised while handing a finished job to its sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Append log rejected record: {0}")]
    Journal(#[from] JournalError),

    #[error("Failed to persist record: {0}")]
    Database(#[from] DatabaseError),
}

/// Receives the summary of every completed job.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn complete(&self, entry: &RecordEntry) -> Result<(), SinkError>;
}

/// Sink that records to the append log and the relational store.
pub struct LedgerSink {
    log: Arc<RecordLog>,
    database: Option<Database>,
}

impl LedgerSink {
    pub fn new(log: Arc<RecordLog>) -> Self {
        Self {
            log,
            database: None,
        }
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }
}

#[async_trait]
impl CompletionSink for LedgerSink {
    /// Both destinations are attempted; the first error is returned.
    async fn complete(&self, entry: &RecordEntry) -> Result<(), SinkError> {
        let line = entry.to_line()?;
        let hash = content_hash(&line);

        let logged = self.log.add_record(entry).await;

        let persisted = match &self.database {
            Some(db) => db
                .persist_entry(entry, Some(&hash))
                .await
                .map(|outcome| {
                    debug!(
                        record_id = outcome.record_id,
                        created = outcome.created,
                        items = outcome.items_inserted,
                        "Persisted record"
                    );
                }),
            None => Ok(()),
        };

        logged?;
        persisted?;
        Ok(())
    }
}

/// Resolves an outcome to `(relative_url, absolute_path)`.
fn locate(outcome: &TaskOutcome, output_dir: &Path) -> Option<(String, PathBuf)> {
    let TaskOutcome::Success {
        url,
        original_url,
        saved_path,
    } = outcome
    else {
        return None;
    };

    let serving = original_url
        .as_deref()
        .filter(|u| u.starts_with(IMAGE_URL_PREFIX))
        .or_else(|| Some(url.as_str()).filter(|u| u.starts_with(IMAGE_URL_PREFIX)));

    let absolute = saved_path.clone().or_else(|| {
        let id = image_id_from_url(serving?)?;
        safe_join(output_dir, &decode_image_id(id)?)
    })?;

    let relative = match serving {
        Some(url) => url.to_string(),
        None => {
            let rel = relative_to(output_dir, &absolute)?;
            image_urls(&encode_image_id(&rel)).1
        }
    };

    Some((relative, absolute))
}

/// Most recently modified files directly under `dir`, newest first.
fn recent_files(dir: &Path, limit: usize) -> Vec<PathBuf> {
    let mut files: Vec<(SystemTime, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files.into_iter().take(limit).map(|(_, path)| path).collect()
}

/// Relative output roots resolve against the working directory.
fn item(task: &Task, relative_url: String, path: &Path) -> GeneratedItem {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    GeneratedItem {
        seed: task.sampling.seed.to_string(),
        temperature: task.sampling.temperature,
        top_p: task.sampling.top_p,
        relative_url,
        absolute_path: absolute.to_string_lossy().into_owned(),
    }
}

/// Builds the record for a finished job.
///
/// Item locations come from each outcome's saved path, else from its
/// `/api/images/{id}/...` URL decoded against `output_dir`. If no
/// successful outcome can be located, the newest files in the job's
/// category directory stand in for them, at most one per success.
pub fn assemble_entry(
    job_id: &str,
    ctx: &JobContext,
    tasks: &[Task],
    outcomes: &[TaskOutcome],
    output_dir: &Path,
) -> RecordEntry {
    let mut items: Vec<GeneratedItem> = tasks
        .iter()
        .zip(outcomes)
        .filter_map(|(task, outcome)| {
            let (relative, absolute) = locate(outcome, output_dir)?;
            Some(item(task, relative, &absolute))
        })
        .collect();

    let succeeded: Vec<&Task> = tasks
        .iter()
        .zip(outcomes)
        .filter(|(_, o)| o.is_success())
        .map(|(t, _)| t)
        .collect();

    if items.is_empty() && !succeeded.is_empty() {
        let category_dir = output_dir.join(safe_dir_name(&ctx.category));
        let found = recent_files(&category_dir, succeeded.len());
        if !found.is_empty() {
            warn!(
                job_id = %job_id,
                dir = %category_dir.display(),
                found = found.len(),
                "Outcomes carried no locations, using newest category files"
            );
        }
        items = succeeded
            .iter()
            .zip(&found)
            .filter_map(|(task, path)| {
                let rel = relative_to(output_dir, path)?;
                Some(item(task, image_urls(&encode_image_id(&rel)).1, path))
            })
            .collect();
    }

    let first = tasks.first();
    let refined = first
        .map(|t| t.prompt.clone())
        .unwrap_or_else(|| RefinedPrompt::new(ctx.prompt.clone(), ""));
    let model_name = first
        .map(|t| t.model.trim())
        .filter(|m| !m.is_empty())
        .or_else(|| Some(ctx.model.trim()).filter(|m| !m.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| ctx.service.to_string());

    RecordEntry {
        job_id: Some(job_id.to_string()),
        user_id: ctx.user_id.clone(),
        session_id: ctx.session_id.clone(),
        created_at: ctx.created_at.clone(),
        base_prompt: ctx.prompt.clone(),
        category_prompt: ctx.category.clone(),
        refined_positive: refined.positive,
        refined_negative: refined.negative,
        positive_zh: refined.positive_zh,
        negative_zh: refined.negative_zh,
        aspect_ratio: ctx.aspect_ratio.clone(),
        quality: ctx.resolution.clone(),
        count: ctx.count as u32,
        model_name,
        items,
    }
    .normalize(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ServiceKind;
    use crate::scheduler::task::SamplingParams;
    use tempfile::TempDir;

    fn task(index: usize, seed: u32) -> Task {
        Task {
            index,
            prompt: RefinedPrompt::new(format!("p{}", index), "n"),
            sampling: SamplingParams {
                seed,
                temperature: 1.0,
                top_p: 0.8,
            },
            service: ServiceKind::Wan,
            model: "wan2.6-t2i".to_string(),
            category: "animals".to_string(),
            size: "1024*1024".to_string(),
            resolution: "1K".to_string(),
            inherited: false,
            delta_ratio: None,
        }
    }

    fn ctx() -> JobContext {
        JobContext::new("a cat", ServiceKind::Wan, 3)
            .with_category("animals")
            .with_created_at("2025010203")
    }

    #[test]
    fn test_saved_path_and_url_resolution() {
        let dir = TempDir::new().unwrap();
        let out = std::path::absolute(dir.path()).unwrap();
        let id = encode_image_id("animals/b.png");
        let (thumb, raw) = image_urls(&id);

        let outcomes = vec![
            TaskOutcome::Success {
                url: "https://cdn.example/a.png".to_string(),
                original_url: None,
                saved_path: Some(out.join("animals/a.png")),
            },
            TaskOutcome::Success {
                url: thumb,
                original_url: Some(raw.clone()),
                saved_path: None,
            },
            TaskOutcome::failure("timeout"),
        ];
        let tasks = vec![task(0, 11), task(1, 22), task(2, 33)];

        let entry = assemble_entry("job-1", &ctx(), &tasks, &outcomes, &out);
        assert_eq!(entry.items.len(), 2);

        assert_eq!(entry.items[0].seed, "11");
        assert_eq!(
            entry.items[0].relative_url,
            image_urls(&encode_image_id("animals/a.png")).1
        );
        assert_eq!(entry.items[1].relative_url, raw);
        assert_eq!(
            entry.items[1].absolute_path,
            out.join("animals/b.png").to_string_lossy()
        );

        assert_eq!(entry.refined_positive, "p0");
        assert_eq!(entry.model_name, "wan2.6-t2i");
        assert_eq!(entry.count, 3);
        assert_eq!(entry.created_at, "2025010203");
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_falls_back_to_newest_category_files() {
        let dir = TempDir::new().unwrap();
        let out = std::path::absolute(dir.path()).unwrap();
        let category = out.join("animals");
        std::fs::create_dir_all(&category).unwrap();
        std::fs::write(category.join("only.png"), b"png").unwrap();

        let outcomes = vec![
            TaskOutcome::Success {
                url: "https://cdn.example/a.png".to_string(),
                original_url: None,
                saved_path: None,
            },
            TaskOutcome::Success {
                url: "https://cdn.example/b.png".to_string(),
                original_url: None,
                saved_path: None,
            },
        ];
        let tasks = vec![task(0, 1), task(1, 2)];

        let entry = assemble_entry("job-2", &ctx(), &tasks, &outcomes, &out);
        assert_eq!(entry.items.len(), 1);
        assert_eq!(entry.items[0].seed, "1");
        assert!(entry.items[0].absolute_path.ends_with("only.png"));
    }

    #[test]
    fn test_model_falls_back_to_service_name() {
        let mut t = task(0, 1);
        t.model.clear();
        let entry = assemble_entry(
            "job-3",
            &ctx(),
            &[t],
            &[TaskOutcome::failure("x")],
            Path::new("/tmp"),
        );
        assert_eq!(entry.model_name, ServiceKind::Wan.to_string());
        assert!(entry.items.is_empty());
    }

    #[test]
    fn test_relative_output_root_yields_absolute_paths() {
        let out = Path::new("outputs");
        let outcomes = vec![TaskOutcome::Success {
            url: "https://cdn.example/a.png".to_string(),
            original_url: None,
            saved_path: Some(out.join("animals/a.png")),
        }];

        let entry = assemble_entry("job-4", &ctx(), &[task(0, 5)], &outcomes, out);
        assert_eq!(entry.items.len(), 1);
        assert!(Path::new(&entry.items[0].absolute_path).is_absolute());
        assert_eq!(
            entry.items[0].relative_url,
            image_urls(&encode_image_id("animals/a.png")).1
        );
        assert!(entry.validate().is_ok());
    }
}
