//! Database schema constants.
//!
//! One statement per constant: SQLite's prepared statements execute a
//! single statement at a time.

/// Job summaries. `job_id` and `content_hash` are each unique; SQLite
/// allows any number of NULLs under a unique constraint, which lets
/// ingested lines without a job id coexist.
pub const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT UNIQUE,
    user_id TEXT NOT NULL DEFAULT '-1',
    session_id TEXT NOT NULL DEFAULT '-1',
    created_at TEXT NOT NULL,
    base_prompt TEXT NOT NULL,
    category TEXT NOT NULL,
    refined_positive TEXT NOT NULL,
    refined_negative TEXT NOT NULL DEFAULT '',
    positive_zh TEXT,
    negative_zh TEXT,
    aspect_ratio TEXT NOT NULL,
    quality TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 1,
    model_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'completed',
    item_count INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT UNIQUE,
    inserted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Generated artifacts, one row per file.
pub const CREATE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
    seed TEXT NOT NULL,
    temperature REAL NOT NULL,
    top_p REAL NOT NULL,
    relative_url TEXT NOT NULL,
    absolute_path TEXT NOT NULL,
    inserted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(record_id, seed, relative_url, absolute_path)
)
"#;

pub const CREATE_RECORDS_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at)";

pub const CREATE_RECORDS_CATEGORY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_category ON records(category)";

pub const CREATE_RECORDS_MODEL_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_model ON records(model_name)";

pub const CREATE_RECORDS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_status ON records(status)";

pub const CREATE_ITEMS_RECORD_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_items_record_id ON items(record_id)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_RECORDS_TABLE,
        CREATE_ITEMS_TABLE,
        CREATE_RECORDS_CREATED_AT_INDEX,
        CREATE_RECORDS_CATEGORY_INDEX,
        CREATE_RECORDS_MODEL_INDEX,
        CREATE_RECORDS_STATUS_INDEX,
        CREATE_ITEMS_RECORD_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const RECORDS: &str = "records";
    pub const ITEMS: &str = "items";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 7);
        // Records must come first (items reference it)
        assert!(statements[0].contains(tables::RECORDS));
        assert!(statements[1].contains("REFERENCES records(id)"));
        assert!(statements[2..]
            .iter()
            .all(|s| s.starts_with("CREATE INDEX")));
    }
}
