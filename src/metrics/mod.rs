//! Metrics module for Prometheus-based monitoring.
//!
//! Covers job and task throughput, pool occupancy, and journal health.
//!
//! # Example
//!
//! ```ignore
//! use image_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_job("completed");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    JOBS_TOTAL, JOB_QUEUE_DEPTH, JOURNAL_FLUSH_DURATION, JOURNAL_FLUSH_FAILURES,
    JOURNAL_LINES_WRITTEN, JOURNAL_RECORDS_DROPPED, POOL_ACTIVE, REGISTRY, TASKS_TOTAL,
    TASK_DURATION,
};
