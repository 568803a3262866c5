//! The record service: a bounded queue in front of a single writer task,
//! plus an hourly archiver.
//!
//! Producers wait at most the enqueue timeout and the entry is dropped past
//! it. Lines sitting in the queue or the current batch are lost if the
//! process dies before the next flush.
//!
//! While a full batch waits on a failed flush the writer stops draining the
//! queue, so a sustained write failure reaches producers as
//! [`JournalError::QueueSaturated`] instead of growing the batch.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JournalSettings;
use crate::metrics::MetricsCollector;

use super::entry::RecordEntry;
use super::storage::{ArchiveReport, JournalLayout, JournalWriter, VerifyReport};
use super::JournalError;

/// How long the writer waits on an empty queue before re-checking the
/// flush deadline.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Delay before retrying a failed flush; doubles up to [`RETRY_MAX`].
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

struct Running {
    shutdown: broadcast::Sender<()>,
    writer: JoinHandle<()>,
    archiver: JoinHandle<()>,
}

/// Append-log service with explicit `start`/`stop`.
pub struct RecordLog {
    settings: JournalSettings,
    layout: JournalLayout,
    sender: RwLock<Option<mpsc::Sender<String>>>,
    running: tokio::sync::Mutex<Option<Running>>,
    metrics: MetricsCollector,
}

impl RecordLog {
    pub fn new(settings: JournalSettings) -> Self {
        let layout = JournalLayout::new(&settings.raw_dir, &settings.archive_dir);
        Self {
            settings,
            layout,
            sender: RwLock::new(None),
            running: tokio::sync::Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn layout(&self) -> &JournalLayout {
        &self.layout
    }

    /// Spawns the writer and archiver. Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<(), JournalError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let writer = JournalWriter::open(self.layout.clone())?;
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);

        let writer_task = tokio::spawn(run_writer(
            rx,
            Arc::new(Mutex::new(writer)),
            self.settings.clone(),
            shutdown.subscribe(),
            self.metrics,
        ));
        let archiver_task = tokio::spawn(run_archiver(
            self.layout.clone(),
            self.settings.clone(),
            shutdown.subscribe(),
        ));

        *self.sender.write().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        *running = Some(Running {
            shutdown,
            writer: writer_task,
            archiver: archiver_task,
        });

        info!(
            raw_dir = %self.layout.raw_dir().display(),
            capacity = self.settings.queue_capacity,
            "Record log started"
        );
        Ok(())
    }

    /// Stops accepting records, drains the queue, flushes and waits for the
    /// background tasks.
    pub async fn stop(&self) -> Result<(), JournalError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        self.sender
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let _ = running.shutdown.send(());
        running
            .writer
            .await
            .map_err(|e| JournalError::Task(e.to_string()))?;
        running
            .archiver
            .await
            .map_err(|e| JournalError::Task(e.to_string()))?;

        info!("Record log stopped");
        Ok(())
    }

    /// Queues `entry` for writing.
    ///
    /// Waits at most the configured enqueue timeout for queue space; past
    /// it the entry is dropped and [`JournalError::QueueSaturated`] is
    /// returned.
    pub async fn add_record(&self, entry: &RecordEntry) -> Result<(), JournalError> {
        let line = entry.to_line()?;
        let sender = self
            .sender
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(JournalError::NotRunning)?;

        let timeout = self.settings.enqueue_timeout();
        match sender.send_timeout(line, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics.record_journal_drop();
                error!(
                    job_id = entry.job_id.as_deref().unwrap_or("-"),
                    timeout_ms = timeout.as_millis() as u64,
                    "Record queue saturated, entry dropped"
                );
                Err(JournalError::QueueSaturated(timeout))
            }
            Err(SendTimeoutError::Closed(_)) => Err(JournalError::NotRunning),
        }
    }

    /// Lines waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    pub async fn verify_day(&self, day: NaiveDate) -> Result<VerifyReport, JournalError> {
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || layout.verify_day(day))
            .await
            .map_err(|e| JournalError::Task(e.to_string()))?
    }

    /// Archives every closed day immediately, ignoring the archive hour.
    pub async fn archive_now(&self) -> Result<ArchiveReport, JournalError> {
        let layout = self.layout.clone();
        let today = Utc::now().date_naive();
        tokio::task::spawn_blocking(move || layout.archive_older_days(today))
            .await
            .map_err(|e| JournalError::Task(e.to_string()))?
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<String>,
    writer: Arc<Mutex<JournalWriter>>,
    settings: JournalSettings,
    mut shutdown: broadcast::Receiver<()>,
    metrics: MetricsCollector,
) {
    let batch_size = settings.batch_size.max(1);
    let flush_interval = settings.flush_interval();
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut last_flush = Instant::now();
    let mut backoff = RETRY_BASE;
    let mut retry_at: Option<Instant> = None;

    loop {
        if batch.len() >= batch_size {
            // A full batch is waiting on a failed flush. Receiving stops so the
            // bounded queue fills and `add_record` pushes back on producers.
            let wake = retry_at.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep_until(wake.into()) => {}
            }
        } else {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = tokio::time::timeout(IDLE_POLL, rx.recv()) => match received {
                    Ok(Some(line)) => batch.push(line),
                    Ok(None) => break,
                    Err(_) => {}
                },
            }
        }

        let retry_ready = retry_at.is_none_or(|at| Instant::now() >= at);
        let due = last_flush.elapsed() >= flush_interval;
        if retry_ready && !batch.is_empty() && (batch.len() >= batch_size || due) {
            let queued = rx.len();
            batch = flush(&writer, batch, queued, metrics).await;
            last_flush = Instant::now();
            if batch.is_empty() {
                backoff = RETRY_BASE;
                retry_at = None;
            } else {
                warn!(
                    pending = batch.len(),
                    retry_ms = backoff.as_millis() as u64,
                    "Journal flush incomplete, backing off"
                );
                retry_at = Some(last_flush + backoff);
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }
    }

    rx.close();
    while let Ok(line) = rx.try_recv() {
        batch.push(line);
    }
    if !batch.is_empty() {
        batch = flush(&writer, batch, 0, metrics).await;
    }
    if !batch.is_empty() {
        error!(lost = batch.len(), "Record log stopped with unwritten lines");
    }
}

/// Writes `batch` on the blocking pool and returns the lines still unwritten.
async fn flush(
    writer: &Arc<Mutex<JournalWriter>>,
    batch: Vec<String>,
    queued: usize,
    metrics: MetricsCollector,
) -> Vec<String> {
    let started = Instant::now();
    let total = batch.len();
    let writer = Arc::clone(writer);

    let joined = tokio::task::spawn_blocking(move || {
        let mut writer = writer.lock().unwrap_or_else(|p| p.into_inner());
        write_batch(&mut writer, batch)
    })
    .await;

    let (written, remaining) = match joined {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, lines = total, "Journal flush task panicked");
            metrics.record_flush(0, true, started.elapsed());
            return Vec::new();
        }
    };

    let elapsed = started.elapsed();
    metrics.record_flush(written, !remaining.is_empty(), elapsed);
    debug!(
        lines = written,
        pending = remaining.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        queue_depth = queued,
        "Flushed journal batch"
    );
    remaining
}

fn write_batch(writer: &mut JournalWriter, batch: Vec<String>) -> (usize, Vec<String>) {
    let mut written = 0;
    let mut lines = batch.into_iter();

    while let Some(line) = lines.next() {
        match writer.append_line(&line) {
            Ok(()) => written += 1,
            Err(JournalError::Sidecar(e)) => {
                written += 1;
                warn!(error = %e, "Journal line written without its sidecar hash");
            }
            Err(e) => {
                error!(error = %e, "Journal write failed, keeping batch for next flush");
                let mut rest = vec![line];
                rest.extend(lines);
                return (written, rest);
            }
        }
    }

    (written, Vec::new())
}

/// Archives closed days when `now` falls in the archive hour; `None`
/// outside it.
fn archive_if_due(
    layout: &JournalLayout,
    archive_hour_utc: u32,
    now: DateTime<Utc>,
) -> Option<Result<ArchiveReport, JournalError>> {
    if now.hour() != archive_hour_utc {
        return None;
    }
    Some(layout.archive_older_days(now.date_naive()))
}

async fn run_archiver(
    layout: JournalLayout,
    settings: JournalSettings,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = settings.archive_interval().max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let layout = layout.clone();
                let hour = settings.archive_hour_utc;
                let pass = tokio::task::spawn_blocking(move || {
                    archive_if_due(&layout, hour, Utc::now())
                })
                .await;
                match pass {
                    Ok(None) => {}
                    Ok(Some(Ok(report))) => {
                        if !report.archived.is_empty() {
                            info!(archived = ?report.archived, skipped = report.skipped.len(), "Archive pass finished");
                        }
                    }
                    Ok(Some(Err(e))) => error!(error = %e, "Archive pass failed"),
                    Err(e) => error!(error = %e, "Archive task panicked"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::entry::sha256_hex;
    use crate::metrics::{init_metrics, JOURNAL_RECORDS_DROPPED};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> JournalSettings {
        JournalSettings {
            raw_dir: dir.path().join("raw"),
            archive_dir: dir.path().join("raw/archive"),
            flush_interval_ms: 50,
            enqueue_timeout_ms: 50,
            ..JournalSettings::default()
        }
    }

    fn entry(job: &str) -> RecordEntry {
        RecordEntry::from_line(&format!(
            r#"{{"job_id":"{}","base_prompt":"p","category_prompt":"c","refined_positive":"r","model_name":"m"}}"#,
            job
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_records_are_flushed_on_stop() {
        let dir = TempDir::new().unwrap();
        let log = RecordLog::new(settings(&dir));
        log.start().await.unwrap();
        for i in 0..5 {
            log.add_record(&entry(&format!("job-{}", i))).await.unwrap();
        }
        log.stop().await.unwrap();

        let today = Utc::now().date_naive();
        let content = std::fs::read_to_string(log.layout().log_path(today)).unwrap();
        assert_eq!(content.lines().count(), 5);
        assert!(content.contains("job-4"));

        let sidecar = std::fs::read_to_string(log.layout().sidecar_path(today)).unwrap();
        let first_line = content.split_inclusive('\n').next().unwrap();
        assert_eq!(sidecar.lines().next().unwrap(), sha256_hex(first_line.as_bytes()));

        let report = log.verify_day(today).await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.matched, 5);
    }

    #[tokio::test]
    async fn test_add_record_requires_running_service() {
        let dir = TempDir::new().unwrap();
        let log = RecordLog::new(settings(&dir));
        assert!(matches!(
            log.add_record(&entry("x")).await,
            Err(JournalError::NotRunning)
        ));

        log.start().await.unwrap();
        log.stop().await.unwrap();
        assert!(matches!(
            log.add_record(&entry("x")).await,
            Err(JournalError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_write_batch_keeps_unwritten_lines() {
        let dir = TempDir::new().unwrap();
        let layout = JournalLayout::new(dir.path().join("raw"), dir.path().join("archive"));
        let mut writer = JournalWriter::open(layout.clone()).unwrap();
        // Turn the log path into a directory so opening it fails.
        std::fs::create_dir_all(layout.log_path(Utc::now().date_naive())).unwrap();

        let (written, rest) = write_batch(&mut writer, vec!["a".into(), "b".into()]);
        assert_eq!(written, 0);
        assert_eq!(rest, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_writes_saturate_the_queue() {
        let _ = init_metrics();
        let dropped = || JOURNAL_RECORDS_DROPPED.get().map(|c| c.get()).unwrap_or(0.0);

        let dir = TempDir::new().unwrap();
        let log = RecordLog::new(JournalSettings {
            queue_capacity: 1,
            batch_size: 1,
            enqueue_timeout_ms: 100,
            ..settings(&dir)
        });
        // A directory where today's log should be makes every write fail.
        let today = Utc::now().date_naive();
        std::fs::create_dir_all(log.layout().log_path(today)).unwrap();
        log.start().await.unwrap();

        // The first line is taken by the writer and stuck in its batch, the
        // second fills the queue, the third has nowhere to go.
        log.add_record(&entry("stuck")).await.unwrap();
        log.add_record(&entry("queued")).await.unwrap();
        let before = dropped();
        let result = log.add_record(&entry("dropped")).await;
        assert!(matches!(result, Err(JournalError::QueueSaturated(_))));
        assert!(dropped() >= before + 1.0);
        assert_eq!(log.queue_depth(), 1);

        log.stop().await.unwrap();
        let report = log.verify_day(today).await.unwrap();
        assert!(!report.exists);
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_interval() {
        let dir = TempDir::new().unwrap();
        let log = RecordLog::new(JournalSettings {
            batch_size: 100,
            ..settings(&dir)
        });
        log.start().await.unwrap();
        for i in 0..3 {
            log.add_record(&entry(&format!("job-{}", i))).await.unwrap();
        }

        let path = log.layout().log_path(Utc::now().date_naive());
        let mut lines = 0;
        for _ in 0..100 {
            lines = std::fs::read_to_string(&path)
                .map(|c| c.lines().count())
                .unwrap_or(0);
            if lines == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Written while the service is still running, well short of a batch.
        assert_eq!(lines, 3);
        log.stop().await.unwrap();
    }

    #[test]
    fn test_archive_runs_only_in_archive_hour() {
        let dir = TempDir::new().unwrap();
        let layout = JournalLayout::new(dir.path().join("raw"), dir.path().join("archive"));
        let mut writer = JournalWriter::open(layout.clone()).unwrap();
        writer
            .append_line_at("old", Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap())
            .unwrap();
        drop(writer);
        let old_day = NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();

        for hour in [0, 1, 3, 23] {
            let now = Utc.with_ymd_and_hms(2025, 4, 5, hour, 30, 0).unwrap();
            assert!(archive_if_due(&layout, 2, now).is_none());
        }
        assert!(layout.log_path(old_day).is_file());

        let now = Utc.with_ymd_and_hms(2025, 4, 5, 2, 10, 0).unwrap();
        let report = archive_if_due(&layout, 2, now).unwrap().unwrap();
        assert_eq!(report.archived, vec!["2025-04-01".to_string()]);
        assert!(!layout.log_path(old_day).exists());
        assert!(layout.archived_log_path(old_day).is_file());
    }
}
