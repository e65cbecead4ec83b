//! Per-job subscriptions: history replay followed by live updates.
//!
//! A subscriber attaches to the bus *before* snapshotting the registry.
//! Anything published after the snapshot is therefore already queued on the
//! tap, and anything the snapshot covers is recognised by its revision and
//! skipped, so the merged stream has no gaps and no duplicates.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{EventBus, Tap, TapGuard};
use crate::job::{Job, JobUpdate};
use crate::registry::Registry;

/// Entry point for clients that want to follow a job.
#[derive(Debug, Clone)]
pub struct Subscriptions {
    registry: Arc<Registry>,
}

impl Subscriptions {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Follow `job_id`.
    ///
    /// Yields every stored log entry in order, then live updates, and ends
    /// right after the job's `Finished` update or when `cancel` fires. For
    /// a job that is already terminal this is the replay plus a synthesized
    /// `Finished`. An id the registry does not know yet gets no replay; the
    /// stream waits for live updates under that id.
    pub fn subscribe(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = JobUpdate> + Send>> {
        let bus = self.registry.bus().clone();
        let tap = bus.attach(job_id);
        let snapshot = self.registry.get(job_id);
        merge(bus, job_id, snapshot, tap, cancel)
    }
}

fn merge(
    bus: EventBus,
    job_id: Uuid,
    snapshot: Option<Job>,
    tap: Tap,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = JobUpdate> + Send>> {
    let guard = TapGuard::new(bus, job_id, tap);

    match snapshot {
        // A terminal snapshot already holds everything the job will say.
        Some(job) if job.status.is_terminal() => {
            drop(guard);
            replay_finished(job, cancel)
        }
        snapshot => follow(guard, snapshot, cancel),
    }
}

fn replay_finished(
    job: Job,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = JobUpdate> + Send>> {
    let stream = async_stream::stream! {
        for entry in job.logs {
            if cancel.is_cancelled() {
                return;
            }
            yield JobUpdate::Log { entry };
        }
        if !cancel.is_cancelled() {
            yield JobUpdate::Finished {
                status: job.status,
                result: job.result,
            };
        }
    };

    Box::pin(stream)
}

fn follow(
    mut guard: TapGuard,
    snapshot: Option<Job>,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = JobUpdate> + Send>> {
    let stream = async_stream::stream! {
        let mut seen = 0;

        if let Some(job) = snapshot {
            seen = job.revision;
            for entry in job.logs {
                if cancel.is_cancelled() {
                    return;
                }
                yield JobUpdate::Log { entry };
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = guard.tap.next() => next,
            };
            let Some(envelope) = next else {
                break;
            };
            if envelope.revision <= seen {
                continue;
            }
            seen = envelope.revision;
            let finished = envelope.update.is_finished();
            yield envelope.update;
            if finished {
                break;
            }
        }
    };

    Box::pin(stream)
}
