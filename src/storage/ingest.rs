//! Replays append-log files into the record tables.
//!
//! Every line goes through [`Database::persist_entry`], the same path live
//! completions take, so replaying a day that was already persisted live is
//! a no-op and replaying into an empty database rebuilds the same rows.
//! Lines that parse but fail [`RecordEntry::validate`] are counted and left
//! out of the index.

use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::journal::{content_hash, RecordEntry};

use super::database::{Database, DatabaseError};

/// Errors raised while ingesting log files.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Background read failed: {0}")]
    Task(String),
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Non-empty lines seen.
    pub total: usize,
    /// Records newly created.
    pub inserted: usize,
    /// Items newly created.
    pub items_inserted: usize,
    /// Lines that could not be parsed.
    pub skipped: usize,
    /// Lines that parsed but failed validation.
    pub invalid: usize,
}

impl IngestReport {
    fn merge(&mut self, other: IngestReport) {
        self.total += other.total;
        self.inserted += other.inserted;
        self.items_inserted += other.items_inserted;
        self.skipped += other.skipped;
        self.invalid += other.invalid;
    }
}

/// True for `*.json` and `*.json.gz` log files, not their sidecars.
fn is_log_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".json") || name.ends_with(".json.gz")
}

fn read_log(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        let mut out = Vec::new();
        GzDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    } else {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Bulk loader from log files into the database.
pub struct Ingestor {
    db: Database,
}

impl Ingestor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Ingests one log file, plain or gzipped.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport, IngestError> {
        let owned = path.to_path_buf();
        let content = tokio::task::spawn_blocking(move || read_log(&owned))
            .await
            .map_err(|e| IngestError::Task(e.to_string()))?
            .map_err(|source| IngestError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut report = IngestReport::default();
        let now = Utc::now();

        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            report.total += 1;

            let entry = match RecordEntry::from_line(line) {
                Ok(entry) => entry.normalize(now),
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping unparseable log line"
                    );
                    report.skipped += 1;
                    continue;
                }
            };
            if let Err(reason) = entry.validate() {
                warn!(
                    file = %path.display(),
                    line = lineno + 1,
                    reason = %reason,
                    "Skipping invalid log entry"
                );
                report.invalid += 1;
                continue;
            }

            let outcome = self
                .db
                .persist_entry(&entry, Some(&content_hash(line)))
                .await?;
            if outcome.created {
                report.inserted += 1;
            }
            report.items_inserted += outcome.items_inserted;
        }

        info!(
            file = %path.display(),
            total = report.total,
            inserted = report.inserted,
            items = report.items_inserted,
            skipped = report.skipped,
            invalid = report.invalid,
            "Ingested log file"
        );
        Ok(report)
    }

    /// Ingests a file, or every log file under a directory in name order.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestReport, IngestError> {
        if !path.is_dir() {
            return self.ingest_file(path).await;
        }

        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_log_file(e.path()))
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let mut report = IngestReport::default();
        for file in files {
            debug!(file = %file.display(), "Ingesting");
            report.merge(self.ingest_file(&file).await?);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::{entry, open};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ingest_counts_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let path = dir.path().join("2025-01-02.json");
        let content = format!(
            "{}\nnot json\n\n{}",
            entry(Some("a")).to_line().unwrap().trim_end(),
            entry(None).to_line().unwrap()
        );
        std::fs::write(&path, content).unwrap();

        let ingestor = Ingestor::new(db.clone());
        let first = ingestor.ingest_file(&path).await.unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.items_inserted, 4);
        assert_eq!(first.skipped, 1);

        let second = ingestor.ingest_file(&path).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.items_inserted, 0);

        let rows = db
            .list_records(&crate::storage::RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.item_count == 2));
    }

    #[tokio::test]
    async fn test_ingest_gzipped_directory() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let logs = dir.path().join("archive");
        std::fs::create_dir_all(&logs).unwrap();

        let mut encoder = GzEncoder::new(
            std::fs::File::create(logs.join("2025-01-01.json.gz")).unwrap(),
            Compression::default(),
        );
        encoder
            .write_all(entry(Some("gz")).to_line().unwrap().as_bytes())
            .unwrap();
        encoder.finish().unwrap();
        std::fs::write(logs.join("2025-01-01.json.sha256.gz"), b"ignored").unwrap();

        let report = Ingestor::new(db.clone()).ingest_path(&logs).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.inserted, 1);
        assert!(db.get_record_by_job_id("gz").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ingest_counts_invalid_entries() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let path = dir.path().join("2025-01-03.json");

        let mut bad_quality = entry(Some("bad-quality"));
        bad_quality.quality = "ultra".to_string();
        let mut relative_path = entry(Some("relative-path"));
        relative_path.items[0].absolute_path = "out/a.png".to_string();
        let content: String = [entry(Some("good")), bad_quality, relative_path]
            .iter()
            .map(|e| e.to_line().unwrap())
            .collect();
        std::fs::write(&path, content).unwrap();

        let report = Ingestor::new(db.clone()).ingest_file(&path).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.invalid, 2);
        assert_eq!(report.skipped, 0);
        assert!(db.get_record_by_job_id("good").await.unwrap().is_some());
        assert!(db.get_record_by_job_id("bad-quality").await.unwrap().is_none());
    }

    #[test]
    fn test_is_log_file() {
        assert!(is_log_file(Path::new("/x/2025-01-01.json")));
        assert!(is_log_file(Path::new("2025-01-01.json.gz")));
        assert!(!is_log_file(Path::new("2025-01-01.json.sha256")));
        assert!(!is_log_file(Path::new("2025-01-01.json.sha256.gz")));
    }
}
