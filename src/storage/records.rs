//! Record repository: one row per completed job.

use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::journal::RecordEntry;

use super::database::{Database, DatabaseError};

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RecordRow {
    pub id: i64,
    pub job_id: Option<String>,
    pub user_id: String,
    pub session_id: String,
    pub created_at: String,
    pub base_prompt: String,
    pub category: String,
    pub refined_positive: String,
    pub refined_negative: String,
    pub positive_zh: Option<String>,
    pub negative_zh: Option<String>,
    pub aspect_ratio: String,
    pub quality: String,
    pub count: i64,
    pub model_name: String,
    pub status: String,
    pub item_count: i64,
    pub content_hash: Option<String>,
}

const RECORD_COLUMNS: &str = "id, job_id, user_id, session_id, created_at, base_prompt, category, \
     refined_positive, refined_negative, positive_zh, negative_zh, aspect_ratio, quality, count, \
     model_name, status, item_count, content_hash";

/// Filter for listing records. All set fields must match exactly.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub created_at: Option<String>,
    pub category: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_created_at(mut self, bucket: impl Into<String>) -> Self {
        self.created_at = Some(bucket.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn conditions(&self) -> Vec<(&'static str, &str)> {
        [
            ("created_at", self.created_at.as_deref()),
            ("category", self.category.as_deref()),
            ("model_name", self.model.as_deref()),
            ("status", self.status.as_deref()),
        ]
        .into_iter()
        .filter_map(|(col, value)| value.map(|v| (col, v)))
        .collect()
    }
}

async fn find_id(
    tx: &mut Transaction<'_, Sqlite>,
    column: &'static str,
    value: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let sql = format!("SELECT id FROM records WHERE {} = ?", column);
    let row: Option<(i64,)> = sqlx::query_as(&sql)
        .bind(value)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|(id,)| id))
}

async fn insert_row(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &RecordEntry,
    content_hash: Option<&str>,
    on_conflict_ignore: bool,
) -> Result<u64, sqlx::Error> {
    let mut sql = String::from(
        r#"
        INSERT INTO records (
            job_id, user_id, session_id, created_at, base_prompt, category,
            refined_positive, refined_negative, positive_zh, negative_zh,
            aspect_ratio, quality, count, model_name, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    );
    if on_conflict_ignore {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }

    let result = sqlx::query(&sql)
        .bind(entry.job_id.as_deref())
        .bind(&entry.user_id)
        .bind(&entry.session_id)
        .bind(&entry.created_at)
        .bind(&entry.base_prompt)
        .bind(&entry.category_prompt)
        .bind(&entry.refined_positive)
        .bind(&entry.refined_negative)
        .bind(entry.positive_zh.as_deref())
        .bind(entry.negative_zh.as_deref())
        .bind(&entry.aspect_ratio)
        .bind(&entry.quality)
        .bind(i64::from(entry.count))
        .bind(&entry.model_name)
        .bind(content_hash)
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected())
}

async fn update_row(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    entry: &RecordEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE records SET
            user_id = ?, session_id = ?, created_at = ?, base_prompt = ?, category = ?,
            refined_positive = ?, refined_negative = ?, positive_zh = ?, negative_zh = ?,
            aspect_ratio = ?, quality = ?, count = ?, model_name = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(&entry.user_id)
    .bind(&entry.session_id)
    .bind(&entry.created_at)
    .bind(&entry.base_prompt)
    .bind(&entry.category_prompt)
    .bind(&entry.refined_positive)
    .bind(&entry.refined_negative)
    .bind(entry.positive_zh.as_deref())
    .bind(entry.negative_zh.as_deref())
    .bind(&entry.aspect_ratio)
    .bind(&entry.quality)
    .bind(i64::from(entry.count))
    .bind(&entry.model_name)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Returns `(record_id, created)`.
async fn upsert_tx(
    pool: &SqlitePool,
    entry: &RecordEntry,
    content_hash: Option<&str>,
) -> Result<(i64, bool), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let job_id = entry.job_id.as_deref().filter(|j| !j.is_empty());

    if let Some(job_id) = job_id {
        if let Some(id) = find_id(&mut tx, "job_id", job_id).await? {
            update_row(&mut tx, id, entry).await?;
            tx.commit().await?;
            return Ok((id, false));
        }
    }

    if insert_row(&mut tx, entry, content_hash, true).await? == 1 {
        let (id,): (i64,) = sqlx::query_as("SELECT last_insert_rowid()")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok((id, true));
    }

    // Conflict: the row exists under this job id or this content hash.
    let mut existing = None;
    if let Some(job_id) = job_id {
        existing = find_id(&mut tx, "job_id", job_id).await?;
    }
    if existing.is_none() {
        if let Some(hash) = content_hash {
            existing = find_id(&mut tx, "content_hash", hash).await?;
        }
    }
    if let Some(id) = existing {
        tx.commit().await?;
        return Ok((id, false));
    }

    insert_row(&mut tx, entry, None, false).await?;
    let (id,): (i64,) = sqlx::query_as("SELECT last_insert_rowid()")
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok((id, true))
}

impl Database {
    /// Inserts or updates the record for `entry`.
    ///
    /// An existing row with the same job id is updated in place (its
    /// content hash and item count are left alone). Otherwise the row is
    /// inserted; when the insert conflicts, the existing id is resolved by
    /// job id and then by content hash. Returns `(record_id, created)`.
    pub async fn upsert_record(
        &self,
        entry: &RecordEntry,
        content_hash: Option<&str>,
    ) -> Result<(i64, bool), DatabaseError> {
        let pool = self.pool();
        self.with_lock_retry("upsert_record", || upsert_tx(pool, entry, content_hash))
            .await
    }

    pub async fn get_record(&self, id: i64) -> Result<Option<RecordRow>, DatabaseError> {
        let pool = self.pool();
        let sql = format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS);
        let sql = sql.as_str();
        self.with_lock_retry("get_record", || {
            sqlx::query_as::<_, RecordRow>(sql)
                .bind(id)
                .fetch_optional(pool)
        })
        .await
    }

    pub async fn get_record_by_job_id(
        &self,
        job_id: &str,
    ) -> Result<Option<RecordRow>, DatabaseError> {
        let pool = self.pool();
        let sql = format!("SELECT {} FROM records WHERE job_id = ?", RECORD_COLUMNS);
        let sql = sql.as_str();
        self.with_lock_retry("get_record_by_job_id", || {
            sqlx::query_as::<_, RecordRow>(sql)
                .bind(job_id)
                .fetch_optional(pool)
        })
        .await
    }

    /// Lists records matching `filter`, newest insertion first.
    pub async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<RecordRow>, DatabaseError> {
        let conditions = filter.conditions();
        let mut sql = format!("SELECT {} FROM records", RECORD_COLUMNS);
        if !conditions.is_empty() {
            let clauses: Vec<String> = conditions
                .iter()
                .map(|(col, _)| format!("{} = ?", col))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC");
        // SQLite needs a LIMIT before OFFSET; -1 means unbounded.
        if filter.limit.is_some() || filter.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let pool = self.pool();
        let sql = sql.as_str();
        let conditions = &conditions;
        self.with_lock_retry("list_records", || {
            let mut query = sqlx::query_as::<_, RecordRow>(sql);
            for (_, value) in conditions {
                query = query.bind(*value);
            }
            if filter.limit.is_some() || filter.offset.is_some() {
                query = query
                    .bind(filter.limit.unwrap_or(-1))
                    .bind(filter.offset.unwrap_or(0));
            }
            query.fetch_all(pool)
        })
        .await
    }

    pub async fn update_record_status(&self, id: i64, status: &str) -> Result<(), DatabaseError> {
        let pool = self.pool();
        let result = self
            .with_lock_retry("update_record_status", || {
                sqlx::query(
                    "UPDATE records SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                )
                .bind(status)
                .bind(id)
                .execute(pool)
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("record {}", id)));
        }
        Ok(())
    }

    /// Deletes a record; its items go with it.
    pub async fn delete_record(&self, id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool();
        let result = self
            .with_lock_retry("delete_record", || {
                sqlx::query("DELETE FROM records WHERE id = ?")
                    .bind(id)
                    .execute(pool)
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("record {}", id)));
        }
        Ok(())
    }
}
