//! In-memory job registry.
//!
//! Holds every job record for the lifetime of the process. Each mutation
//! that subscribers care about bumps the job's `revision` and is published
//! on the [`EventBus`] while the write lock is still held, so the bus
//! delivers updates in exactly the order the registry applied them.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::job::{Job, JobKind, JobStatus, JobUpdate, LogEntry, Progress, StreamKind};

/// The process-wide job store.
#[derive(Debug)]
pub struct Registry {
    bus: EventBus,
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl Registry {
    /// Create an empty registry publishing on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// The bus this registry publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a pending job with a fresh id.
    pub fn create(&self, kind: JobKind) -> Job {
        let job = Job::new(Uuid::now_v7(), Some(kind));
        self.write().insert(job.id, job.clone());
        debug!(job_id = %job.id, kind = %kind, "job created");
        job
    }

    /// Snapshot of a job, logs included.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.read().get(&id).cloned()
    }

    /// Append a log line, coalescing consecutive progress lines.
    ///
    /// A progress line replaces the tail entry in place when the tail is
    /// itself a progress entry; anything else is appended. Logs for an
    /// unknown id create a bare pending record.
    pub fn append_log(
        &self,
        id: Uuid,
        stream: StreamKind,
        message: impl Into<String>,
        progress: Option<Progress>,
    ) -> LogEntry {
        let message = message.into();
        let timestamp = Utc::now();

        let mut jobs = self.write();
        let job = jobs.entry(id).or_insert_with(|| {
            debug!(job_id = %id, "log for unknown job, creating bare record");
            Job::new(id, None)
        });

        let entry = match job.logs.last_mut() {
            Some(tail) if progress.is_some() && tail.progress.is_some() => {
                tail.stream = stream;
                tail.message = message;
                tail.timestamp = timestamp;
                tail.progress = progress;
                tail.clone()
            }
            _ => {
                let entry = LogEntry {
                    job_id: id,
                    seq: job.logs.len(),
                    stream,
                    message,
                    timestamp,
                    progress,
                };
                job.logs.push(entry.clone());
                entry
            }
        };

        job.revision += 1;
        self.bus.publish(
            id,
            job.revision,
            JobUpdate::Log {
                entry: entry.clone(),
            },
        );
        entry
    }

    /// Transition a job's status.
    ///
    /// Returns `false` without touching anything if the job does not exist
    /// or the transition is not allowed; in particular a terminal status is
    /// never overwritten. The first terminal transition records
    /// `completed_at` and `result` and publishes the job's single
    /// `Finished` update.
    pub fn set_status(&self, id: Uuid, status: JobStatus, result: Option<String>) -> bool {
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };

        if !JobStatus::can_transition(job.status, status) {
            debug!(
                job_id = %id,
                from = %job.status,
                to = %status,
                "ignoring status transition"
            );
            return false;
        }

        let now = Utc::now();
        job.status = status;
        if status == JobStatus::Running {
            job.started_at = Some(now);
        }

        if status.is_terminal() {
            job.completed_at = Some(now);
            job.result = result;
            job.revision += 1;
            self.bus.publish(
                id,
                job.revision,
                JobUpdate::Finished {
                    status,
                    result: job.result.clone(),
                },
            );
        }

        true
    }

    /// Every job, oldest first.
    pub fn list_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read().values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    /// Remove terminal jobs that finished more than `max_age` ago.
    pub fn reap_older_than(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|t| t < cutoff))
        });
        before - jobs.len()
    }

    /// Remove terminal jobs with a result file accepted by `matcher`.
    pub fn delete_by_result<F>(&self, matcher: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.result_files().any(&matcher)));
        before - jobs.len()
    }
}
