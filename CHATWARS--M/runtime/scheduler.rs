use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chatwars_commands::{ActionRequest, KeyId};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch, Notify},
    task::JoinSet,
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

use crate::{
    dispatcher::{DispatchFailure, DispatchHandle, FailureSink},
    events::{BatchId, ScheduledEvent, Transition},
};

/// Scheduler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The batch supervisor ended without a report.
    #[error("{0} was aborted before completion")]
    Aborted(BatchId),
}

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Requests in the batch.
    pub requested: usize,
    /// Presses handed to the dispatcher.
    pub presses: usize,
    /// Releases handed to the dispatcher.
    pub releases: usize,
    /// Presses suppressed by cancellation.
    pub suppressed: usize,
    /// Edges the dispatcher refused.
    pub failed: usize,
}

#[derive(Debug, Default)]
struct LaneReport {
    presses: usize,
    releases: usize,
    suppressed: usize,
    failed: usize,
}

/// Handle to a scheduled batch.
#[derive(Debug)]
pub struct BatchHandle {
    id: BatchId,
    requested: usize,
    cancel: Arc<watch::Sender<bool>>,
    done: oneshot::Receiver<BatchReport>,
}

impl BatchHandle {
    /// Batch identifier.
    #[must_use]
    pub const fn id(&self) -> BatchId {
        self.id
    }

    /// Number of requests in the batch.
    #[must_use]
    pub const fn requested(&self) -> usize {
        self.requested
    }

    /// Suppresses presses that have not fired. Idempotent.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Waits for every lane of the batch to finish.
    pub async fn finished(self) -> Result<BatchReport, SchedulerError> {
        self.done.await.map_err(|_| SchedulerError::Aborted(self.id))
    }
}

#[derive(Default)]
struct Shared {
    batches: Mutex<HashMap<BatchId, Arc<watch::Sender<bool>>>>,
    next_batch: AtomicU64,
    next_pair: AtomicU64,
    pending: AtomicUsize,
    idle: Notify,
}

/// Timer engine turning validated requests into timed key edges.
///
/// Every key of a batch gets its own task walking that key's edges in
/// firing order, so a release never overtakes its press.
#[derive(Clone)]
pub struct Scheduler {
    team: String,
    dispatcher: DispatchHandle,
    sink: Arc<dyn FailureSink>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("team", &self.team)
            .field("active_batches", &self.active_batches())
            .field("pending_events", &self.pending_events())
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler feeding `dispatcher`.
    pub fn new(team: impl Into<String>, dispatcher: DispatchHandle, sink: Arc<dyn FailureSink>) -> Self {
        Self {
            team: team.into(),
            dispatcher,
            sink,
            shared: Arc::new(Shared {
                next_batch: AtomicU64::new(1),
                ..Shared::default()
            }),
        }
    }

    /// Schedules a batch whose offsets are measured from `reference`.
    pub fn schedule(&self, requests: &[ActionRequest], reference: Instant) -> BatchHandle {
        let id = BatchId(self.shared.next_batch.fetch_add(1, Ordering::SeqCst));
        let mut lanes: BTreeMap<KeyId, Vec<(usize, ScheduledEvent)>> = BTreeMap::new();
        for (order, request) in requests.iter().enumerate() {
            let pair_id = self.shared.next_pair.fetch_add(1, Ordering::SeqCst);
            let lane = lanes.entry(request.key().clone()).or_default();
            for (transition, offset_ms) in [
                (Transition::Press, u64::from(request.delay_ms())),
                (Transition::Release, request.release_offset_ms()),
            ] {
                lane.push((
                    order,
                    ScheduledEvent {
                        batch_id: id,
                        pair_id,
                        fire_at: reference + Duration::from_millis(offset_ms),
                        offset_ms,
                        key: request.key().clone(),
                        verb: request.verb().to_string(),
                        transition,
                    },
                ));
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        self.shared.batches.lock().insert(id, Arc::clone(&cancel));
        self.shared
            .pending
            .fetch_add(requests.len() * 2, Ordering::SeqCst);

        let mut tasks = JoinSet::new();
        for mut lane in lanes.into_values() {
            lane.sort_by(|(a_order, a), (b_order, b)| {
                (a.fire_at, a_order, a.transition).cmp(&(b.fire_at, b_order, b.transition))
            });
            tasks.spawn(run_lane(
                lane.into_iter().map(|(_, event)| event).collect(),
                cancel_rx.clone(),
                self.dispatcher.clone(),
                Arc::clone(&self.sink),
                Arc::clone(&self.shared),
            ));
        }

        debug!(team = %self.team, batch = %id, requests = requests.len(), "batch scheduled");
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let team = self.team.clone();
        let requested = requests.len();
        tokio::spawn(async move {
            let mut report = BatchReport {
                batch_id: id,
                requested,
                ..BatchReport::default()
            };
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(lane) => {
                        report.presses += lane.presses;
                        report.releases += lane.releases;
                        report.suppressed += lane.suppressed;
                        report.failed += lane.failed;
                    }
                    Err(err) => warn!(team = %team, batch = %id, error = %err, "lane task ended abnormally"),
                }
            }
            shared.batches.lock().remove(&id);
            shared.idle.notify_waiters();
            debug!(team = %team, batch = %id, ?report, "batch finished");
            let _ = done_tx.send(report);
        });

        BatchHandle {
            id,
            requested,
            cancel,
            done: done_rx,
        }
    }

    /// Cancels one batch. Returns whether it was still active.
    pub fn cancel(&self, id: BatchId) -> bool {
        self.shared.batches.lock().get(&id).map_or(false, |cancel| {
            cancel.send_replace(true);
            true
        })
    }

    /// Cancels every active batch. Returns how many were active.
    pub fn cancel_all(&self) -> usize {
        let batches = self.shared.batches.lock();
        for cancel in batches.values() {
            cancel.send_replace(true);
        }
        batches.len()
    }

    /// Whether a batch still has edges to fire.
    #[must_use]
    pub fn is_active(&self, id: BatchId) -> bool {
        self.shared.batches.lock().contains_key(&id)
    }

    /// Number of batches still running.
    #[must_use]
    pub fn active_batches(&self) -> usize {
        self.shared.batches.lock().len()
    }

    /// Edges not yet handed to the dispatcher or suppressed.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Dispatcher fed by this scheduler.
    #[must_use]
    pub const fn dispatcher(&self) -> &DispatchHandle {
        &self.dispatcher
    }

    /// Resolves once no batch is active.
    pub async fn until_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.active_batches() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_lane(
    events: Vec<ScheduledEvent>,
    mut cancelled: watch::Receiver<bool>,
    dispatcher: DispatchHandle,
    sink: Arc<dyn FailureSink>,
    shared: Arc<Shared>,
) -> LaneReport {
    let mut report = LaneReport::default();
    let mut suppressed = HashSet::new();
    for event in events {
        if event.is_press() {
            let cancelled_first = tokio::select! {
                biased;
                () = wait_cancelled(&mut cancelled) => true,
                () = sleep_until(event.fire_at) => false,
            };
            if cancelled_first || *cancelled.borrow() {
                suppressed.insert(event.pair_id);
                report.suppressed += 1;
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
        } else {
            if suppressed.remove(&event.pair_id) {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            // Releases of dispatched presses ignore cancellation.
            sleep_until(event.fire_at).await;
        }

        shared.pending.fetch_sub(1, Ordering::SeqCst);
        let is_press = event.is_press();
        match dispatcher.dispatch(event.clone()) {
            Ok(()) if is_press => report.presses += 1,
            Ok(()) => report.releases += 1,
            Err(err) => {
                report.failed += 1;
                warn!(key = %event.key, error = %err, "could not hand edge to dispatcher");
                sink.report(DispatchFailure::new(&event, &err));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::RecordingBackend, target::InputTarget};
    use chatwars_commands::{builtin, validate, RawTiming, VerbTable};

    #[derive(Default)]
    struct NullSink;

    impl FailureSink for NullSink {
        fn report(&self, _failure: DispatchFailure) {}
    }

    fn setup() -> (Scheduler, RecordingBackend, VerbTable) {
        let backend = RecordingBackend::new();
        let sink: Arc<dyn FailureSink> = Arc::new(NullSink);
        let dispatcher =
            DispatchHandle::spawn_local(InputTarget::local(0), Arc::new(backend.clone()), Arc::clone(&sink));
        (
            Scheduler::new("test", dispatcher, sink),
            backend,
            builtin("towerfall_keyboard").unwrap(),
        )
    }

    fn request(table: &VerbTable, verb: &str, delay: i64, duration: Option<i64>) -> ActionRequest {
        validate(RawTiming::delayed(delay, duration), table.resolve(verb).unwrap()).unwrap()
    }

    async fn settle(backend: &RecordingBackend, scheduler: &Scheduler, expected: usize) {
        scheduler.until_idle().await;
        while backend.inputs().len() < expected || scheduler.dispatcher().stats().queued > 0 {
            tokio::task::yield_now().await;
        }
    }

    fn timeline(backend: &RecordingBackend, t0: Instant) -> Vec<(String, Transition, u128)> {
        backend
            .inputs()
            .into_iter()
            .map(|input| {
                (
                    input.key.to_string(),
                    input.transition,
                    (input.at - t0).as_millis(),
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn chained_commands_share_the_reference_time() {
        let (scheduler, backend, table) = setup();
        let t0 = Instant::now();
        let handle = scheduler.schedule(
            &[
                request(&table, "right", 0, Some(500)),
                request(&table, "down", 200, Some(300)),
            ],
            t0,
        );
        let report = handle.finished().await.unwrap();
        settle(&backend, &scheduler, 4).await;
        assert_eq!((report.presses, report.releases, report.suppressed), (2, 2, 0));
        let mut events = timeline(&backend, t0);
        events.sort_by_key(|(key, transition, at)| (*at, key.clone(), *transition));
        assert_eq!(
            events,
            vec![
                ("right".to_string(), Transition::Press, 0),
                ("down".to_string(), Transition::Press, 200),
                ("down".to_string(), Transition::Release, 500),
                ("right".to_string(), Transition::Release, 500),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_presses_fire_together() {
        let (scheduler, backend, table) = setup();
        let t0 = Instant::now();
        scheduler
            .schedule(
                &[
                    request(&table, "right", 200, Some(300)),
                    request(&table, "left", 200, Some(300)),
                ],
                t0,
            )
            .finished()
            .await
            .unwrap();
        settle(&backend, &scheduler, 4).await;
        let presses: Vec<u128> = timeline(&backend, t0)
            .into_iter()
            .filter(|(_, transition, _)| *transition == Transition::Press)
            .map(|(_, _, at)| at)
            .collect();
        assert_eq!(presses, vec![200, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_delay_fires_press_and_release_together() {
        let (scheduler, backend, table) = setup();
        let t0 = Instant::now();
        scheduler
            .schedule(&[request(&table, "right", 1200, Some(300))], t0)
            .finished()
            .await
            .unwrap();
        settle(&backend, &scheduler, 2).await;
        assert_eq!(
            timeline(&backend, t0),
            vec![
                ("right".to_string(), Transition::Press, 1200),
                ("right".to_string(), Transition::Release, 1200),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_edges_keep_firing_order() {
        let (scheduler, backend, table) = setup();
        let t0 = Instant::now();
        scheduler
            .schedule(
                &[
                    request(&table, "right", 0, Some(300)),
                    request(&table, "right", 100, Some(50)),
                ],
                t0,
            )
            .finished()
            .await
            .unwrap();
        settle(&backend, &scheduler, 4).await;
        let order: Vec<(Transition, u128)> = timeline(&backend, t0)
            .into_iter()
            .map(|(_, transition, at)| (transition, at))
            .collect();
        assert_eq!(
            order,
            vec![
                (Transition::Press, 0),
                (Transition::Press, 100),
                (Transition::Release, 150),
                (Transition::Release, 300),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_releases_of_dispatched_presses() {
        let (scheduler, backend, table) = setup();
        let t0 = Instant::now();
        let handle = scheduler.schedule(
            &[
                request(&table, "jump", 0, Some(500)),
                request(&table, "right", 300, Some(100)),
            ],
            t0,
        );
        tokio::time::sleep_until(t0 + Duration::from_millis(100)).await;
        handle.cancel();
        assert!(scheduler.cancel(handle.id()));
        assert_eq!(scheduler.cancel_all(), 1);
        let report = handle.finished().await.unwrap();
        settle(&backend, &scheduler, 2).await;

        assert_eq!((report.presses, report.releases, report.suppressed), (1, 1, 1));
        assert_eq!(
            timeline(&backend, t0),
            vec![
                ("c".to_string(), Transition::Press, 0),
                ("c".to_string(), Transition::Release, 500),
            ]
        );
        assert_eq!(scheduler.pending_events(), 0);
        assert_eq!(scheduler.active_batches(), 0);
        assert!(!scheduler.cancel(BatchId(999)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_finishes_immediately() {
        let (scheduler, _backend, _table) = setup();
        let report = scheduler.schedule(&[], Instant::now()).finished().await.unwrap();
        assert_eq!(report.requested, 0);
        scheduler.until_idle().await;
    }
}
