//! In-process event bus fanning job updates out to per-job subscribers.
//!
//! Every subscriber owns an unbounded queue registered under the job id it
//! asked for, so publishing never blocks on a slow reader, never drops an
//! update for a live reader, and never routes one job's updates to another
//! job's subscribers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::JobUpdate;

/// An update as delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub job_id: Uuid,
    /// The job revision this update produced.
    pub revision: u64,
    pub update: JobUpdate,
}

/// Live tap on one job's updates.
///
/// Yields envelopes in publish order and ends once the job's `Finished`
/// update has been delivered.
pub type Tap = UnboundedReceiverStream<Envelope>;

/// Owns a tap and unregisters it from the bus when dropped, including
/// when the stream holding it is dropped before it finishes.
pub(crate) struct TapGuard {
    bus: EventBus,
    job_id: Uuid,
    pub(crate) tap: Tap,
}

impl TapGuard {
    pub(crate) fn new(bus: EventBus, job_id: Uuid, tap: Tap) -> Self {
        Self { bus, job_id, tap }
    }
}

impl Drop for TapGuard {
    fn drop(&mut self) {
        self.tap.close();
        self.bus.prune(self.job_id);
    }
}

/// Process-wide publish/subscribe hub. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct EventBus {
    taps: Arc<Mutex<HashMap<Uuid, Vec<mpsc::UnboundedSender<Envelope>>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("jobs", &self.lock().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<mpsc::UnboundedSender<Envelope>>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.taps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an update to every current subscriber of `job_id`.
    ///
    /// Fire-and-forget: zero subscribers is fine. A `Finished` update
    /// detaches all of the job's subscribers after delivery.
    pub fn publish(&self, job_id: Uuid, revision: u64, update: JobUpdate) {
        let mut taps = self.lock();
        let finished = update.is_finished();

        let Some(senders) = taps.get_mut(&job_id) else {
            return;
        };

        let envelope = Envelope {
            job_id,
            revision,
            update,
        };
        // Drop senders whose receiver has gone away.
        senders.retain(|tx| tx.send(envelope.clone()).is_ok());

        if finished || senders.is_empty() {
            taps.remove(&job_id);
        }
    }

    /// Attach a raw live tap for `job_id`.
    pub fn attach(&self, job_id: Uuid) -> Tap {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(job_id).or_default().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Subscribe to `job_id` until its `Finished` update or until `cancel`
    /// fires, whichever comes first.
    pub fn subscribe(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = Envelope> + Send>> {
        let mut guard = TapGuard::new(self.clone(), job_id, self.attach(job_id));

        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = guard.tap.next() => next,
                };
                let Some(envelope) = next else {
                    break;
                };
                let finished = envelope.update.is_finished();
                yield envelope;
                if finished {
                    break;
                }
            }
        };

        Box::pin(stream)
    }

    /// Forget taps for `job_id` whose reader has been dropped.
    pub fn prune(&self, job_id: Uuid) {
        let mut taps = self.lock();
        if let Some(senders) = taps.get_mut(&job_id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                taps.remove(&job_id);
            }
        }
    }

    /// Number of live taps for `job_id`, counting ones whose reader has
    /// been dropped but not yet pruned by a publish.
    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.lock()
            .get(&job_id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of jobs with at least one registered tap, open or not.
    pub fn tracked_jobs(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, LogEntry, StreamKind};
    use chrono::Utc;

    fn log(job_id: Uuid, seq: usize, message: &str) -> JobUpdate {
        JobUpdate::Log {
            entry: LogEntry {
                job_id,
                seq,
                stream: StreamKind::Stdout,
                message: message.to_string(),
                timestamp: Utc::now(),
                progress: None,
            },
        }
    }

    fn finished() -> JobUpdate {
        JobUpdate::Finished {
            status: JobStatus::Completed,
            result: Some("out.png".to_string()),
        }
    }

    fn message(envelope: &Envelope) -> &str {
        match &envelope.update {
            JobUpdate::Log { entry } => &entry.message,
            JobUpdate::Finished { .. } => "<finished>",
        }
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Uuid::now_v7(), 1, finished());
    }

    #[tokio::test]
    async fn subscribers_only_see_their_own_job() {
        let bus = EventBus::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let sub_a = bus.subscribe(a, CancellationToken::new());
        let sub_b = bus.subscribe(b, CancellationToken::new());

        bus.publish(a, 1, log(a, 0, "a0"));
        bus.publish(b, 1, log(b, 0, "b0"));
        bus.publish(a, 2, log(a, 1, "a1"));
        bus.publish(b, 2, finished());
        bus.publish(a, 3, finished());

        let got_a: Vec<Envelope> = sub_a.collect().await;
        let got_b: Vec<Envelope> = sub_b.collect().await;

        assert!(got_a.iter().all(|e| e.job_id == a));
        assert!(got_b.iter().all(|e| e.job_id == b));
        assert_eq!(
            got_a.iter().map(message).collect::<Vec<_>>(),
            vec!["a0", "a1", "<finished>"]
        );
        assert_eq!(
            got_b.iter().map(message).collect::<Vec<_>>(),
            vec!["b0", "<finished>"]
        );
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_same_sequence() {
        let bus = EventBus::new();
        let job = Uuid::now_v7();
        let subs: Vec<_> = (0..3)
            .map(|_| bus.subscribe(job, CancellationToken::new()))
            .collect();

        for i in 0..5 {
            bus.publish(job, i + 1, log(job, i as usize, &format!("line {i}")));
        }
        bus.publish(job, 6, finished());

        let mut sequences = Vec::new();
        for sub in subs {
            let revisions: Vec<u64> = sub.map(|e| e.revision).collect().await;
            sequences.push(revisions);
        }
        assert_eq!(sequences[0], vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(sequences[0], sequences[1]);
        assert_eq!(sequences[1], sequences[2]);
    }

    #[tokio::test]
    async fn cancel_ends_only_that_subscription() {
        let bus = EventBus::new();
        let job = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let mut leaving = bus.subscribe(job, cancel.clone());
        let staying = bus.subscribe(job, CancellationToken::new());

        bus.publish(job, 1, log(job, 0, "first"));
        assert_eq!(leaving.next().await.map(|e| e.revision), Some(1));

        cancel.cancel();
        assert!(leaving.next().await.is_none());

        bus.publish(job, 2, log(job, 1, "second"));
        bus.publish(job, 3, finished());
        let rest: Vec<u64> = staying.map(|e| e.revision).collect().await;
        assert_eq!(rest, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn finished_detaches_all_taps() {
        let bus = EventBus::new();
        let job = Uuid::now_v7();
        let _sub = bus.subscribe(job, CancellationToken::new());
        assert_eq!(bus.subscriber_count(job), 1);

        bus.publish(job, 1, finished());
        assert_eq!(bus.subscriber_count(job), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let job = Uuid::now_v7();
        let sub = bus.subscribe(job, CancellationToken::new());
        drop(sub);
        assert_eq!(bus.subscriber_count(job), 0);

        bus.publish(job, 1, log(job, 0, "nobody listening"));
        assert!(bus.lock().get(&job).is_none());
    }

    #[test]
    fn prune_forgets_closed_taps() {
        let bus = EventBus::new();
        let job = Uuid::now_v7();
        let kept = bus.attach(job);
        drop(bus.attach(job));
        bus.prune(job);
        assert_eq!(bus.lock().get(&job).map(Vec::len), Some(1));

        drop(kept);
        bus.prune(job);
        assert!(bus.lock().get(&job).is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unregisters_its_tap() {
        let bus = EventBus::new();
        let job = Uuid::now_v7();
        let mut sub = bus.subscribe(job, CancellationToken::new());
        bus.publish(job, 1, log(job, 0, "first"));
        assert_eq!(sub.next().await.map(|e| e.revision), Some(1));

        drop(sub);
        assert_eq!(bus.tracked_jobs(), 0);
    }
}
