//! In-memory job table.
//!
//! Entries are kept for the life of the process so clients can keep polling
//! finished jobs. All critical sections are short and never await.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::job::{JobSnapshot, JobStatus, Progress};
use super::task::TaskOutcome;

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    total: usize,
    completed: usize,
    results: Vec<TaskOutcome>,
    history: Vec<JobStatus>,
    created_at: DateTime<Utc>,
}

/// Shared job status table.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a job as `submitted`. Re-registering an id resets it.
    pub fn register(&self, job_id: &str, total: usize) {
        self.lock().insert(
            job_id.to_string(),
            JobEntry {
                status: JobStatus::Submitted,
                total,
                completed: 0,
                results: Vec::new(),
                history: vec![JobStatus::Submitted],
                created_at: Utc::now(),
            },
        );
    }

    /// Moves a non-terminal job to `status`. Terminal jobs are left alone.
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(job_id) {
            Some(entry) if !entry.status.is_terminal() => {
                if entry.status != status {
                    entry.status = status;
                    entry.history.push(status);
                }
                true
            }
            _ => false,
        }
    }

    /// Marks the job `running` with the generated task count.
    pub fn start_running(&self, job_id: &str, total: usize) {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.total = total;
            if entry.status != JobStatus::Running {
                entry.status = JobStatus::Running;
                entry.history.push(JobStatus::Running);
            }
        }
    }

    /// Counts one finished task. Never exceeds the job's total.
    pub fn increment_completed(&self, job_id: &str) {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(job_id) {
            if entry.completed < entry.total {
                entry.completed += 1;
            }
        }
    }

    /// Stores results and moves the job to a terminal status.
    pub fn finish(&self, job_id: &str, status: JobStatus, results: Vec<TaskOutcome>) {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.results = results;
            if status == JobStatus::Completed {
                entry.completed = entry.total;
            }
            if entry.status != status {
                entry.status = status;
                entry.history.push(status);
            }
        }
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.lock();
        jobs.get(job_id).map(|entry| JobSnapshot {
            job_id: job_id.to_string(),
            status: entry.status,
            ready: entry.status.is_terminal(),
            progress: Progress::new(entry.total, entry.completed),
            results: entry.results.clone(),
            history: entry.history.clone(),
            created_at: entry.created_at,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
