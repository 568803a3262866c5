//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by image-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all image-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal state, labeled by status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Executed tasks, labeled by outcome and service.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by service.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs waiting for the dispatcher.
pub static JOB_QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Tasks currently holding a pool permit, labeled by pool.
pub static POOL_ACTIVE: OnceLock<GaugeVec> = OnceLock::new();

/// Lines durably appended to the journal.
pub static JOURNAL_LINES_WRITTEN: OnceLock<Counter> = OnceLock::new();

/// Records dropped because the journal queue stayed full.
pub static JOURNAL_RECORDS_DROPPED: OnceLock<Counter> = OnceLock::new();

/// Flushes that left lines unwritten.
pub static JOURNAL_FLUSH_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Journal flush duration in seconds.
pub static JOURNAL_FLUSH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("image_forge_jobs_total", "Jobs that reached a terminal state"),
        &["status"],
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("image_forge_tasks_total", "Total number of tasks executed"),
        &["outcome", "service"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "image_forge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["service"],
    )?;

    let job_queue_depth = Gauge::new(
        "image_forge_job_queue_depth",
        "Jobs waiting for the dispatcher",
    )?;

    let pool_active = GaugeVec::new(
        Opts::new("image_forge_pool_active", "Tasks currently running per pool"),
        &["pool"],
    )?;

    let journal_lines_written = Counter::new(
        "image_forge_journal_lines_written_total",
        "Lines durably appended to the journal",
    )?;

    let journal_records_dropped = Counter::new(
        "image_forge_journal_records_dropped_total",
        "Records dropped because the journal queue stayed full",
    )?;

    let journal_flush_failures = Counter::new(
        "image_forge_journal_flush_failures_total",
        "Journal flushes that left lines unwritten",
    )?;

    let journal_flush_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "image_forge_journal_flush_seconds",
            "Journal flush duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(job_queue_depth.clone()))?;
    registry.register(Box::new(pool_active.clone()))?;
    registry.register(Box::new(journal_lines_written.clone()))?;
    registry.register(Box::new(journal_records_dropped.clone()))?;
    registry.register(Box::new(journal_flush_failures.clone()))?;
    registry.register(Box::new(journal_flush_duration.clone()))?;

    // A second init leaves the first set of metrics in place.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = JOB_QUEUE_DEPTH.set(job_queue_depth);
    let _ = POOL_ACTIVE.set(pool_active);
    let _ = JOURNAL_LINES_WRITTEN.set(journal_lines_written);
    let _ = JOURNAL_RECORDS_DROPPED.set(journal_records_dropped);
    let _ = JOURNAL_FLUSH_FAILURES.set(journal_flush_failures);
    let _ = JOURNAL_FLUSH_DURATION.set(journal_flush_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
