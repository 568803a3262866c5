//! SQLite record index.
//!
//! The relational view of completed jobs: one `records` row per job and one
//! `items` row per generated artifact. It is an index over the append log
//! and can be rebuilt from it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use image_forge::storage::{Database, Ingestor, RecordFilter};
//!
//! let db = Database::connect(&config.database).await?;
//! let outcome = db.persist_entry(&entry, Some(&hash)).await?;
//!
//! let recent = db
//!     .list_records(&RecordFilter::new().with_model("wan2.6-t2i").with_limit(20))
//!     .await?;
//!
//! let report = Ingestor::new(db.clone()).ingest_path("data/raw".as_ref()).await?;
//! ```

pub mod database;
pub mod ingest;
pub mod items;
pub mod migrations;
pub mod pool;
pub mod records;
pub mod schema;

pub use database::{Database, DatabaseError, PersistOutcome};
pub use ingest::{IngestError, IngestReport, Ingestor};
pub use items::{IntegrityReport, ItemRow};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use records::{RecordFilter, RecordRow};
