//! SQLite database client for the record index.
//!
//! Repository operations live in [`super::records`] and [`super::items`];
//! this module holds the client, its error type and the lock-retry helper
//! every operation runs through.

use serde::Serialize;
use sqlx::SqlitePool;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::config::DatabaseSettings;
use crate::journal::RecordEntry;

use super::migrations::MigrationRunner;
use super::pool;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// SQLite stayed busy or locked through every retry.
    #[error("Database locked during '{operation}' after {attempts} attempts")]
    Locked {
        operation: &'static str,
        attempts: u32,
    },

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::QueryFailed(err)
    }
}

/// True for SQLITE_BUSY / SQLITE_LOCKED and their extended codes.
fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code_locked = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| matches!(c & 0xff, 5 | 6))
                .unwrap_or(false);
            let message = db.message().to_lowercase();
            code_locked || message.contains("database is locked") || message.contains("busy")
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
    slow_query: Duration,
    acquire_timeout: Duration,
}

impl RetryPolicy {
    fn from_settings(settings: &DatabaseSettings) -> Self {
        Self {
            attempts: settings.lock_retry_attempts.max(1),
            backoff: Duration::from_millis(settings.lock_retry_backoff_ms),
            slow_query: Duration::from_millis(settings.slow_query_ms),
            acquire_timeout: settings.acquire_timeout(),
        }
    }
}

/// What persisting one entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub record_id: i64,
    /// True when the record row was newly inserted.
    pub created: bool,
    pub items_inserted: usize,
}

/// SQLite database client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl Database {
    /// Connects using `settings` and applies pending migrations.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DatabaseError> {
        let pool = pool::connect(settings).await?;
        let db = Self {
            pool,
            retry: RetryPolicy::from_settings(settings),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Wraps an existing pool with default retry settings.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::from_settings(&DatabaseSettings::default()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs `op`, retrying busy/locked errors with linear backoff
    /// (`backoff * attempt`). Each call to `op` must start from scratch,
    /// typically by opening its own transaction.
    pub(crate) async fn with_lock_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = op().await;
            let elapsed = started.elapsed();

            if elapsed >= self.retry.slow_query {
                warn!(
                    operation = operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Slow database operation"
                );
            }

            match result {
                Ok(value) => return Ok(value),
                Err(sqlx::Error::PoolTimedOut) => {
                    return Err(DatabaseError::PoolTimeout(self.retry.acquire_timeout))
                }
                Err(e) if is_lock_error(&e) => {
                    if attempt >= self.retry.attempts {
                        return Err(DatabaseError::Locked {
                            operation,
                            attempts: attempt,
                        });
                    }
                    let wait = self.retry.backoff * attempt;
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Database locked, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Upserts `entry` as a record and attaches its items.
    ///
    /// Shared by the live completion path and log ingestion so both
    /// produce identical rows for the same line.
    pub async fn persist_entry(
        &self,
        entry: &RecordEntry,
        content_hash: Option<&str>,
    ) -> Result<PersistOutcome, DatabaseError> {
        let (record_id, created) = self.upsert_record(entry, content_hash).await?;
        let (_, items_inserted) = self.insert_items(record_id, &entry.items).await?;
        Ok(PersistOutcome {
            record_id,
            created,
            items_inserted,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Opens a migrated database in `dir`.
    pub async fn open(dir: &TempDir) -> Database {
        let settings = DatabaseSettings {
            url: format!("sqlite://{}", dir.path().join("records.db").display()),
            ..DatabaseSettings::default()
        };
        Database::connect(&settings).await.unwrap()
    }

    pub fn entry(job_id: Option<&str>) -> RecordEntry {
        let job = job_id
            .map(|j| format!(r#""job_id":"{}","#, j))
            .unwrap_or_default();
        RecordEntry::from_line(&format!(
            r#"{{{}"user_id":"u1","session_id":"s1","created_at":"2025010203","base_prompt":"a cat","category_prompt":"animals","refined_positive":"a fluffy cat","refined_negative":"blurry","aspect_ratio":"1:1","quality":"1K","count":2,"model_name":"wan2.6-t2i","items":[{{"seed":"1","temperature":1.0,"top_p":0.8,"relative_url":"/api/images/YQ/raw","absolute_path":"/out/a.png"}},{{"seed":"2","temperature":1.0,"top_p":0.8,"relative_url":"/api/images/Yg/raw","absolute_path":"/out/b.png"}}]}}"#,
            job
        ))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{entry, open};
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persist_entry_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let e = entry(Some("job-1"));

        let first = db.persist_entry(&e, Some("h1")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.items_inserted, 2);

        let second = db.persist_entry(&e, Some("h1")).await.unwrap();
        assert_eq!(second.record_id, first.record_id);
        assert!(!second.created);
        assert_eq!(second.items_inserted, 0);

        let row = db.get_record(first.record_id).await.unwrap().unwrap();
        assert_eq!(row.item_count, 2);
    }

    #[tokio::test]
    async fn test_lock_retry_gives_up_on_non_lock_errors() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let calls = AtomicU32::new(0);
        let pool = db.pool().clone();

        let result: Result<(), _> = db
            .with_lock_retry("bad_query", || {
                calls.fetch_add(1, Ordering::SeqCst);
                let pool = pool.clone();
                async move {
                    sqlx::query("SELECT * FROM missing_table")
                        .execute(&pool)
                        .await
                        .map(|_| ())
                }
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::QueryFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::NotFound("record 7".to_string());
        assert!(err.to_string().contains("record 7"));

        let err = DatabaseError::Locked {
            operation: "insert_item",
            attempts: 3,
        };
        assert!(err.to_string().contains("insert_item"));
        assert!(err.to_string().contains('3'));
    }
}
