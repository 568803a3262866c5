//! image-forge: image generation job orchestration.
//!
//! This library expands generation requests into tasks, runs them against
//! image backends, and records every completed job in a durable,
//! hash-verified append log and a SQLite index rebuilt from that log.

// Core modules
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod refine;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, ForgeConfig};
pub use error::{BackendError, RefineError};
pub use journal::{JournalError, RecordEntry, RecordLog};
pub use scheduler::{DispatchError, JobContext, JobDispatcher, JobStatus, ServiceKind};
pub use storage::{Database, DatabaseError};
