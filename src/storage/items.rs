//! Item repository: generated artifacts attached to a record.
//!
//! Inserts are idempotent on `(record_id, seed, relative_url,
//! absolute_path)`. The parent's `item_count` moves in the same
//! transaction, and only by the number of rows actually inserted.

use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::warn;

use crate::journal::GeneratedItem;

use super::database::{Database, DatabaseError};

/// A stored item.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ItemRow {
    pub id: i64,
    pub record_id: i64,
    pub seed: String,
    pub temperature: f64,
    pub top_p: f64,
    pub relative_url: String,
    pub absolute_path: String,
}

/// Stored versus live item count for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub record_id: i64,
    pub stored: i64,
    pub actual: i64,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.actual
    }
}

/// Inserts `item` if absent. Returns `(item_id, inserted)`.
async fn insert_one(
    tx: &mut Transaction<'_, Sqlite>,
    record_id: i64,
    item: &GeneratedItem,
) -> Result<(i64, bool), sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO items (record_id, seed, temperature, top_p, relative_url, absolute_path)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(record_id, seed, relative_url, absolute_path) DO NOTHING
        "#,
    )
    .bind(record_id)
    .bind(&item.seed)
    .bind(item.temperature)
    .bind(item.top_p)
    .bind(&item.relative_url)
    .bind(&item.absolute_path)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 1 {
        return Ok((result.last_insert_rowid(), true));
    }

    let (id,): (i64,) = sqlx::query_as(
        "SELECT id FROM items WHERE record_id = ? AND seed = ? AND relative_url = ? AND absolute_path = ?",
    )
    .bind(record_id)
    .bind(&item.seed)
    .bind(&item.relative_url)
    .bind(&item.absolute_path)
    .fetch_one(&mut **tx)
    .await?;
    Ok((id, false))
}

async fn bump_item_count(
    tx: &mut Transaction<'_, Sqlite>,
    record_id: i64,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE records SET item_count = MAX(item_count + ?, 0), updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(delta)
    .bind(record_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_items_tx(
    pool: &SqlitePool,
    record_id: i64,
    items: &[GeneratedItem],
) -> Result<(Vec<i64>, usize), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut ids = Vec::with_capacity(items.len());
    let mut inserted = 0usize;

    for item in items {
        let (id, new) = insert_one(&mut tx, record_id, item).await?;
        ids.push(id);
        if new {
            inserted += 1;
        }
    }
    if inserted > 0 {
        bump_item_count(&mut tx, record_id, inserted as i64).await?;
    }

    tx.commit().await?;
    Ok((ids, inserted))
}

/// Returns the deleted row's record id, if a row was deleted.
async fn delete_item_tx(pool: &SqlitePool, item_id: i64) -> Result<Option<i64>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let owner: Option<(i64,)> = sqlx::query_as("SELECT record_id FROM items WHERE id = ?")
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some((record_id,)) = owner else {
        return Ok(None);
    };

    let result = sqlx::query("DELETE FROM items WHERE id = ?")
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 1 {
        bump_item_count(&mut tx, record_id, -1).await?;
    }

    tx.commit().await?;
    Ok(Some(record_id))
}

impl Database {
    /// Inserts one item if absent. Returns `(item_id, inserted)`.
    pub async fn insert_item(
        &self,
        record_id: i64,
        item: &GeneratedItem,
    ) -> Result<(i64, bool), DatabaseError> {
        let pool = self.pool();
        let (ids, inserted) = self
            .with_lock_retry("insert_item", || {
                insert_items_tx(pool, record_id, std::slice::from_ref(item))
            })
            .await?;
        let id = ids.first().copied().unwrap_or_default();
        Ok((id, inserted == 1))
    }

    /// Inserts many items in one transaction. Returns the item ids in input
    /// order and the number of rows newly inserted.
    pub async fn insert_items(
        &self,
        record_id: i64,
        items: &[GeneratedItem],
    ) -> Result<(Vec<i64>, usize), DatabaseError> {
        if items.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let pool = self.pool();
        self.with_lock_retry("insert_items", || insert_items_tx(pool, record_id, items))
            .await
    }

    /// Items of a record in insertion order.
    pub async fn list_items(&self, record_id: i64) -> Result<Vec<ItemRow>, DatabaseError> {
        let pool = self.pool();
        self.with_lock_retry("list_items", || {
            sqlx::query_as::<_, ItemRow>(
                "SELECT id, record_id, seed, temperature, top_p, relative_url, absolute_path \
                 FROM items WHERE record_id = ? ORDER BY id",
            )
            .bind(record_id)
            .fetch_all(pool)
        })
        .await
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Option<ItemRow>, DatabaseError> {
        let pool = self.pool();
        self.with_lock_retry("get_item", || {
            sqlx::query_as::<_, ItemRow>(
                "SELECT id, record_id, seed, temperature, top_p, relative_url, absolute_path \
                 FROM items WHERE id = ?",
            )
            .bind(item_id)
            .fetch_optional(pool)
        })
        .await
    }

    /// Deletes an item and decrements its record's count.
    pub async fn delete_item(&self, item_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool();
        self.with_lock_retry("delete_item", || delete_item_tx(pool, item_id))
            .await?
            .map(|_| ())
            .ok_or_else(|| DatabaseError::NotFound(format!("item {}", item_id)))
    }

    /// Compares a record's stored `item_count` with its live row count.
    ///
    /// A mismatch means a write was interrupted between the item insert and
    /// the counter update. It is logged and reported, never corrected.
    pub async fn validate_record_integrity(
        &self,
        record_id: i64,
    ) -> Result<IntegrityReport, DatabaseError> {
        let pool = self.pool();
        let counts: Option<(i64, i64)> = self
            .with_lock_retry("validate_record_integrity", || {
                sqlx::query_as(
                    "SELECT r.item_count, (SELECT COUNT(*) FROM items i WHERE i.record_id = r.id) \
                     FROM records r WHERE r.id = ?",
                )
                .bind(record_id)
                .fetch_optional(pool)
            })
            .await?;

        let (stored, actual) =
            counts.ok_or_else(|| DatabaseError::NotFound(format!("record {}", record_id)))?;
        let report = IntegrityReport {
            record_id,
            stored,
            actual,
        };
        if !report.is_consistent() {
            warn!(
                record_id = record_id,
                stored = stored,
                actual = actual,
                "Record item_count does not match stored items"
            );
        }
        Ok(report)
    }
}
