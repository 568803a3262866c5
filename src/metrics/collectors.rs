//! High-level recording interface over the raw Prometheus statics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    JOBS_TOTAL, JOB_QUEUE_DEPTH, JOURNAL_FLUSH_DURATION, JOURNAL_FLUSH_FAILURES,
    JOURNAL_LINES_WRITTEN, JOURNAL_RECORDS_DROPPED, POOL_ACTIVE, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording image-forge operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a job reaching a terminal status.
    pub fn record_job(&self, status: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status]).inc();
        }
    }

    /// Records one executed task.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `success` or `failure`
    /// * `service` - Backend family, e.g. `wan`
    /// * `duration` - Wall time spent in the processor
    pub fn record_task(&self, outcome: &str, service: &str, duration: Duration) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome, service]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[service])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            outcome = outcome,
            service = service,
            duration_ms = duration.as_millis() as u64,
            "Recorded task metric"
        );
    }

    pub fn job_enqueued(&self) {
        if let Some(depth) = JOB_QUEUE_DEPTH.get() {
            depth.inc();
        }
    }

    pub fn job_dequeued(&self) {
        if let Some(depth) = JOB_QUEUE_DEPTH.get() {
            depth.dec();
        }
    }

    pub fn pool_task_started(&self, pool: &str) {
        if let Some(active) = POOL_ACTIVE.get() {
            active.with_label_values(&[pool]).inc();
        }
    }

    pub fn pool_task_finished(&self, pool: &str) {
        if let Some(active) = POOL_ACTIVE.get() {
            active.with_label_values(&[pool]).dec();
        }
    }

    /// Records a journal flush: lines written and whether any were left over.
    pub fn record_flush(&self, written: usize, failed: bool, duration: Duration) {
        if let Some(lines) = JOURNAL_LINES_WRITTEN.get() {
            lines.inc_by(written as f64);
        }

        if failed {
            if let Some(failures) = JOURNAL_FLUSH_FAILURES.get() {
                failures.inc();
            }
        }

        if let Some(hist) = JOURNAL_FLUSH_DURATION.get() {
            hist.observe(duration.as_secs_f64());
        }
    }

    pub fn record_journal_drop(&self) {
        if let Some(dropped) = JOURNAL_RECORDS_DROPPED.get() {
            dropped.inc();
        }
    }
}
