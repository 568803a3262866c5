//! Durable, day-partitioned append log of completed jobs.
//!
//! - [`entry`]: the JSON-line record format
//! - [`storage`]: file layout, locked appends, sidecar hashes, archiving
//! - [`service`]: the queued writer and archiver tasks
//!
//! The log is the source of truth; the relational tables can be rebuilt
//! from it with [`crate::storage::Ingestor`].

pub mod entry;
pub mod service;
pub mod storage;

pub use entry::{content_hash, sha256_hex, GeneratedItem, RecordEntry};
pub use service::RecordLog;
pub use storage::{
    parse_day, ArchiveReport, FileLocation, JournalLayout, JournalWriter, VerifyReport,
};

use thiserror::Error;

/// Errors raised by the append log.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Record queue saturated; entry dropped after {0:?}")]
    QueueSaturated(std::time::Duration),

    #[error("Record log is not running")]
    NotRunning,

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The log line was written but its hash could not be appended.
    #[error("Sidecar write failed: {0}")]
    Sidecar(std::io::Error),

    #[error("Background journal task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
