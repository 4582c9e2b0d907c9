use std::{
    collections::HashSet,
    fmt, io,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{BackendError, InputBackend},
    events::{BatchId, ScheduledEvent, Transition},
    target::{InputTarget, TargetMode},
    wire::{FrameWriter, WireError, WireMessage},
};

/// Connection, retry and staleness settings for remote targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Connect attempt timeout.
    pub connect_timeout_ms: u64,
    /// Per-frame write timeout.
    pub io_timeout_ms: u64,
    /// First reconnect delay.
    pub initial_backoff_ms: u64,
    /// Growth factor between reconnect attempts.
    pub backoff_factor: f64,
    /// Reconnect delay ceiling.
    pub max_backoff_ms: u64,
    /// Presses later than this past `fire_at` are dropped with their release.
    pub staleness_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            io_timeout_ms: 3_000,
            initial_backoff_ms: 1_000,
            backoff_factor: 1.1,
            max_backoff_ms: 30_000,
            staleness_ms: 2_000,
        }
    }
}

impl RemoteSettings {
    fn next_backoff(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_factor.max(1.0))
            .min(Duration::from_millis(self.max_backoff_ms))
    }
}

/// Dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The target's worker is gone.
    #[error("dispatch worker for {0} has stopped")]
    WorkerStopped(String),
    /// Local driver failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// TCP connect failed.
    #[error("connect to {addr} failed: {reason}")]
    Connect {
        /// Remote address.
        addr: String,
        /// Underlying error.
        reason: String,
    },
    /// Connect or write exceeded its timeout.
    #[error("timed out talking to {0}")]
    Timeout(String),
    /// Framing or socket error while writing.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Press could not be sent within the staleness window.
    #[error("press of {key} dropped {late_ms} ms after its fire time")]
    Stale {
        /// Device key.
        key: String,
        /// Lateness when dropped.
        late_ms: u64,
    },
}

/// Failure category kept in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worker stopped.
    WorkerStopped,
    /// Local driver error.
    Backend,
    /// Connection could not be established.
    Connect,
    /// Frame could not be written.
    Write,
    /// Press dropped as stale.
    Stale,
}

impl DispatchError {
    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::WorkerStopped(_) => FailureKind::WorkerStopped,
            Self::Backend(_) => FailureKind::Backend,
            Self::Connect { .. } | Self::Timeout(_) => FailureKind::Connect,
            Self::Wire(_) => FailureKind::Write,
            Self::Stale { .. } => FailureKind::Stale,
        }
    }
}

/// Serializable record of one failed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    /// Wall-clock time of the failure.
    pub at: DateTime<Utc>,
    /// Category.
    pub kind: FailureKind,
    /// Batch of the edge.
    pub batch_id: BatchId,
    /// Verb of the edge.
    pub verb: String,
    /// Device key.
    pub key: String,
    /// Press or release.
    pub transition: Transition,
    /// Error text.
    pub detail: String,
}

impl DispatchFailure {
    /// Describes a failed event.
    #[must_use]
    pub fn new(event: &ScheduledEvent, error: &DispatchError) -> Self {
        Self {
            at: Utc::now(),
            kind: error.kind(),
            batch_id: event.batch_id,
            verb: event.verb.clone(),
            key: event.key.to_string(),
            transition: event.transition,
            detail: error.to_string(),
        }
    }
}

/// Receives dispatch failures for a team.
pub trait FailureSink: Send + Sync {
    /// Records one failure. Must not block.
    fn report(&self, failure: DispatchFailure);
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
}

/// Dispatch counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events handed over but not yet processed.
    pub queued: usize,
    /// Edges applied or written.
    pub delivered: u64,
    /// Failed attempts.
    pub failed: u64,
    /// Presses dropped as stale.
    pub stale_dropped: u64,
}

/// Sending side of one target's dispatch worker.
#[derive(Clone)]
pub struct DispatchHandle {
    target: InputTarget,
    tx: UnboundedSender<ScheduledEvent>,
    counters: Arc<Counters>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("target", &self.target)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DispatchHandle {
    /// Spawns the worker matching the target's mode.
    pub fn spawn(
        target: InputTarget,
        backend: Arc<dyn InputBackend>,
        settings: RemoteSettings,
        sink: Arc<dyn FailureSink>,
    ) -> Self {
        match target.mode {
            TargetMode::Local => Self::spawn_local(target, backend, sink),
            TargetMode::Remote => Self::spawn_remote(target, settings, sink),
        }
    }

    /// Worker applying edges to an in-process backend.
    pub fn spawn_local(
        target: InputTarget,
        backend: Arc<dyn InputBackend>,
        sink: Arc<dyn FailureSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_local(
            target.clone(),
            backend,
            sink,
            Arc::clone(&counters),
            rx,
        ));
        Self::assemble(target, tx, counters, worker)
    }

    /// Worker writing frames to a remote input server.
    pub fn spawn_remote(
        target: InputTarget,
        settings: RemoteSettings,
        sink: Arc<dyn FailureSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = RemoteWorker::new(&target, settings, sink, Arc::clone(&counters));
        let worker = tokio::spawn(worker.run(rx));
        Self::assemble(target, tx, counters, worker)
    }

    fn assemble(
        target: InputTarget,
        tx: UnboundedSender<ScheduledEvent>,
        counters: Arc<Counters>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            target,
            tx,
            counters,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Hands an event to the worker without waiting for I/O.
    pub fn dispatch(&self, event: ScheduledEvent) -> Result<(), DispatchError> {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(event).map_err(|_| {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            DispatchError::WorkerStopped(self.target.to_string())
        })
    }

    /// Destination of this handle.
    #[must_use]
    pub const fn target(&self) -> &InputTarget {
        &self.target
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            stale_dropped: self.counters.stale.load(Ordering::SeqCst),
        }
    }

    /// Stops the worker; queued events are discarded.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

#[instrument(skip_all, fields(target = %target))]
async fn run_local(
    target: InputTarget,
    backend: Arc<dyn InputBackend>,
    sink: Arc<dyn FailureSink>,
    counters: Arc<Counters>,
    mut rx: UnboundedReceiver<ScheduledEvent>,
) {
    while let Some(event) = rx.recv().await {
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        match backend
            .apply(target.player_index, &event.key, event.transition)
            .await
        {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::SeqCst);
                debug!(key = %event.key, transition = event.transition.label(), "applied");
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                let err = DispatchError::from(err);
                warn!(key = %event.key, error = %err, "local input failed");
                sink.report(DispatchFailure::new(&event, &err));
            }
        }
    }
    debug!("local dispatch worker finished");
}

struct RemoteWorker {
    addr: String,
    player_index: u8,
    settings: RemoteSettings,
    sink: Arc<dyn FailureSink>,
    counters: Arc<Counters>,
    stream: Option<FrameWriter<TcpStream>>,
    seq: u64,
    backoff: Duration,
    dropped_pairs: HashSet<u64>,
}

impl RemoteWorker {
    fn new(
        target: &InputTarget,
        settings: RemoteSettings,
        sink: Arc<dyn FailureSink>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            addr: target.address().unwrap_or_default(),
            player_index: target.player_index,
            settings,
            sink,
            counters,
            stream: None,
            seq: 0,
            backoff: Duration::from_millis(settings.initial_backoff_ms),
            dropped_pairs: HashSet::new(),
        }
    }

    #[instrument(skip_all, fields(addr = %self.addr))]
    async fn run(mut self, mut rx: UnboundedReceiver<ScheduledEvent>) {
        while let Some(event) = rx.recv().await {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            self.deliver(&event).await;
        }
        debug!("remote dispatch worker finished");
    }

    async fn deliver(&mut self, event: &ScheduledEvent) {
        if !event.is_press() && self.dropped_pairs.remove(&event.pair_id) {
            return;
        }
        loop {
            if event.is_press() {
                let late = Instant::now().saturating_duration_since(event.fire_at);
                if late > Duration::from_millis(self.settings.staleness_ms) {
                    self.dropped_pairs.insert(event.pair_id);
                    self.counters.stale.fetch_add(1, Ordering::SeqCst);
                    let err = DispatchError::Stale {
                        key: event.key.to_string(),
                        late_ms: u64::try_from(late.as_millis()).unwrap_or(u64::MAX),
                    };
                    warn!(key = %event.key, error = %err, "dropping stale press");
                    self.sink.report(DispatchFailure::new(event, &err));
                    return;
                }
            }
            match self.send(event).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                    self.backoff = Duration::from_millis(self.settings.initial_backoff_ms);
                    return;
                }
                Err(err) => {
                    self.stream = None;
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(error = %err, retry_in = ?self.backoff, "remote input failed");
                    self.sink.report(DispatchFailure::new(event, &err));
                    sleep(self.backoff).await;
                    self.backoff = self.settings.next_backoff(self.backoff);
                }
            }
        }
    }

    async fn send(&mut self, event: &ScheduledEvent) -> Result<(), DispatchError> {
        let io_timeout = Duration::from_millis(self.settings.io_timeout_ms);
        // A write into a socket the server already closed still succeeds
        // locally, so the frame would be lost without this check.
        if let Some(reason) = self.stream.as_ref().and_then(|w| peer_gone(w.get_ref())) {
            info!(%reason, "remote input connection lost, reconnecting");
            self.stream = None;
        }
        if self.stream.is_none() {
            let connect = TcpStream::connect(self.addr.as_str());
            let stream = timeout(Duration::from_millis(self.settings.connect_timeout_ms), connect)
                .await
                .map_err(|_| DispatchError::Timeout(self.addr.clone()))?
                .map_err(|err| DispatchError::Connect {
                    addr: self.addr.clone(),
                    reason: err.to_string(),
                })?;
            stream.set_nodelay(true).map_err(WireError::from)?;
            info!("connected to remote input server");
            self.stream = Some(FrameWriter::new(stream));
        }
        let message = WireMessage::new(
            self.player_index,
            event.key.as_str(),
            event.transition,
            self.seq,
        );
        let Some(writer) = self.stream.as_mut() else {
            return Err(DispatchError::WorkerStopped(self.addr.clone()));
        };
        timeout(io_timeout, writer.write_message(&message))
            .await
            .map_err(|_| DispatchError::Timeout(self.addr.clone()))??;
        self.seq += 1;
        Ok(())
    }
}

/// Why the server side of `stream` is gone, if it is. Never blocks.
fn peer_gone(stream: &TcpStream) -> Option<String> {
    let mut scratch = [0_u8; 64];
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => return Some("closed by server".to_string()),
            // The server never writes; discard anything it sent.
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Some(err.to_string()),
        }
    }
}
