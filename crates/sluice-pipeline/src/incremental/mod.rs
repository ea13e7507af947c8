//! # Incremental synchronization engine
//!
//! Applies a source's change stream to the sharded target after the
//! snapshot copy.
//!
//! ```text
//! reader task ──bounded──▶ dispatcher ──bounded──▶ worker 0..N ──▶ target
//!                              ▲                        │
//!                              └──────── acks ──────────┘
//! ```
//!
//! - The reader subscribes at the resume position and resubscribes after
//!   transient stream failures, skipping what it already delivered.
//! - The dispatcher hashes `(table, primary key)` onto a worker, so one
//!   key's changes apply in stream order while distinct keys run in
//!   parallel. An update that changes the key waits until every in-flight
//!   event is applied before and after it is dispatched.
//! - Workers batch their queue, apply each batch with retries, and report
//!   back which sequence numbers completed.
//! - A [`PositionTracker`] turns completions into the highest safe position,
//!   published through [`EngineHandle::applied`]. Persisting that position
//!   is up to the caller.

mod apply;
mod dispatch;
mod tracker;

pub use apply::TableApplier;
pub use tracker::PositionTracker;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_rdbc::TableName;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, ErrorReport, PipelineError, Result};
use crate::event::ChangeEvent;
use crate::metrics;
use crate::position::Position;
use crate::retry::RetryPolicy;
use crate::stream::ChangeStreamReader;

fn default_channel_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    128
}

/// Engine sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Capacity of the reader channel; the reader blocks when it is full
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Apply workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Events per apply batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            workers: default_workers(),
            batch_size: default_batch_size(),
        }
    }
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Not started
    NotStarted,
    /// Subscribing
    Starting,
    /// Applying changes
    Running,
    /// Halted by `pause`
    Paused,
    /// Halted by `stop` or cancellation
    Stopped,
    /// Halted by an error
    Failed,
}

impl EngineState {
    /// Whether the engine has halted
    pub fn is_halted(self) -> bool {
        matches!(self, Self::Paused | Self::Stopped | Self::Failed)
    }
}

/// Counters of a running engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Events received from the reader
    pub received: u64,
    /// Events applied
    pub applied: u64,
    /// Apply conflicts
    pub conflicts: u64,
    /// Events dispatched and not yet covered by the safe position
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    applied: AtomicU64,
    conflicts: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Notification from a running engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A change matched zero or several target rows
    Conflict(ErrorReport),
    /// The engine stopped on an error
    Failed(ErrorReport),
}

/// Appliers by source table
#[derive(Debug, Clone, Default)]
pub struct TableAppliers {
    by_table: HashMap<TableName, TableApplier>,
}

impl TableAppliers {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the applier of `table`
    pub fn insert(&mut self, table: TableName, applier: TableApplier) {
        self.by_table.insert(table, applier);
    }

    /// Applier of `table`. A schema-qualified stream table also matches an
    /// unqualified mapping of the same name.
    pub fn get(&self, table: &TableName) -> Option<&TableApplier> {
        self.by_table.get(table).or_else(|| {
            table
                .schema
                .as_ref()
                .and_then(|_| self.by_table.get(&TableName::new(table.name.clone())))
        })
    }

    /// Number of mapped tables
    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    /// Whether no table is mapped
    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}

/// Applies one source's change stream
pub struct IncrementalEngine {
    job_id: String,
    reader: Arc<dyn ChangeStreamReader>,
    appliers: Arc<TableAppliers>,
    config: IncrementalConfig,
    retry: RetryPolicy,
}

impl std::fmt::Debug for IncrementalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalEngine")
            .field("job_id", &self.job_id)
            .field("reader", &self.reader.name())
            .field("tables", &self.appliers.len())
            .field("config", &self.config)
            .finish()
    }
}

impl IncrementalEngine {
    /// Engine for `reader` applying through `appliers`
    pub fn new(
        job_id: impl Into<String>,
        reader: Arc<dyn ChangeStreamReader>,
        appliers: Arc<TableAppliers>,
        config: IncrementalConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            reader,
            appliers,
            config,
            retry,
        }
    }

    /// Start applying changes at `from` (inclusive).
    ///
    /// The engine runs until `cancel` fires, [`EngineHandle::pause`] or
    /// [`EngineHandle::stop`] is called, or an error is fatal. Work already
    /// handed to workers is applied before it halts.
    pub fn start(&self, from: Option<Position>, cancel: CancellationToken) -> EngineHandle {
        let (state_tx, state) = watch::channel(EngineState::NotStarted);
        let (applied_tx, applied) = watch::channel(from.clone());
        let (events_tx, events) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let intent = Arc::new(Mutex::new(EngineState::Stopped));
        let halt = cancel.child_token();

        let task = EngineTask {
            job_id: self.job_id.clone(),
            reader: self.reader.clone(),
            appliers: self.appliers.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
            counters: counters.clone(),
            state_tx,
            applied_tx,
            events_tx,
            intent: intent.clone(),
        };
        let join = tokio::spawn(task.run(from, halt.clone()));

        EngineHandle {
            state,
            applied,
            events,
            counters,
            intent,
            cancel: halt,
            join,
        }
    }
}

/// Control and observation of a started engine
#[derive(Debug)]
pub struct EngineHandle {
    state: watch::Receiver<EngineState>,
    applied: watch::Receiver<Option<Position>>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    counters: Arc<Counters>,
    intent: Arc<Mutex<EngineState>>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl EngineHandle {
    /// Current state
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver of state changes
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Highest position with every change at or before it applied
    pub fn applied(&self) -> Option<Position> {
        self.applied.borrow().clone()
    }

    /// Receiver of safe position changes
    pub fn applied_receiver(&self) -> watch::Receiver<Option<Position>> {
        self.applied.clone()
    }

    /// Counter snapshot
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Next notification; `None` once the engine has halted and every
    /// notification was taken
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Pending notification, if any
    pub fn try_next_event(&mut self) -> Option<EngineEvent> {
        self.events.try_recv().ok()
    }

    /// Halt, ending in [`EngineState::Paused`]
    pub fn pause(&self) {
        *self.intent.lock() = EngineState::Paused;
        self.cancel.cancel();
    }

    /// Halt, ending in [`EngineState::Stopped`]
    pub fn stop(&self) {
        *self.intent.lock() = EngineState::Stopped;
        self.cancel.cancel();
    }

    /// Wait until the engine halts; returns its final state
    pub async fn join(self) -> EngineState {
        let state = self.state.clone();
        if self.join.await.is_err() {
            return EngineState::Failed;
        }
        let last = *state.borrow();
        last
    }
}

enum ReaderMsg {
    Subscribed,
    Event(ChangeEvent),
    Failed(PipelineError),
}

struct Work {
    seq: u64,
    event: ChangeEvent,
}

enum WorkerMsg {
    Applied {
        seqs: Vec<u64>,
        conflicts: Vec<ErrorReport>,
    },
    Failed(PipelineError),
}

struct EngineTask {
    job_id: String,
    reader: Arc<dyn ChangeStreamReader>,
    appliers: Arc<TableAppliers>,
    config: IncrementalConfig,
    retry: RetryPolicy,
    counters: Arc<Counters>,
    state_tx: watch::Sender<EngineState>,
    applied_tx: watch::Sender<Option<Position>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    intent: Arc<Mutex<EngineState>>,
}

fn fatal_apply(job_id: &str, position: Option<&Position>, e: PipelineError) -> PipelineError {
    let position = position.map(ToString::to_string).unwrap_or_else(|| "start".to_string());
    match e {
        PipelineError::Cancelled => PipelineError::Cancelled,
        PipelineError::FatalApply { message, .. } => PipelineError::FatalApply {
            job_id: job_id.to_string(),
            position,
            message,
        },
        other => PipelineError::FatalApply {
            job_id: job_id.to_string(),
            position,
            message: other.to_string(),
        },
    }
}

impl EngineTask {
    async fn run(self, from: Option<Position>, halt: CancellationToken) {
        self.state_tx.send_replace(EngineState::Starting);
        info!(
            job_id = %self.job_id,
            reader = %self.reader.name(),
            from = ?from.as_ref().map(ToString::to_string),
            "Starting incremental engine"
        );

        let (reader_tx, mut reader_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let reader = tokio::spawn(read_changes(
            self.job_id.clone(),
            self.reader.clone(),
            from.clone(),
            reader_tx,
            self.retry.clone(),
            halt.clone(),
        ));

        let workers = self.config.workers.max(1);
        let queue = self.config.channel_capacity.div_ceil(workers).max(1);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let mut worker_txs = Vec::with_capacity(workers);
        let mut worker_tasks = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(queue);
            worker_txs.push(tx);
            worker_tasks.push(tokio::spawn(apply_worker(
                worker,
                self.job_id.clone(),
                rx,
                ack_tx.clone(),
                self.appliers.clone(),
                self.config.batch_size.max(1),
                self.retry.clone(),
                halt.clone(),
            )));
        }
        drop(ack_tx);

        let mut tracker = PositionTracker::new(from);
        let mut failure: Option<PipelineError> = None;
        loop {
            tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                Some(msg) = ack_rx.recv() => {
                    if let Err(e) = self.on_worker_msg(msg, &mut tracker) {
                        failure = Some(e);
                        break;
                    }
                }
                msg = reader_rx.recv() => match msg {
                    Some(ReaderMsg::Subscribed) => {
                        self.state_tx.send_if_modified(|s| {
                            let starting = *s == EngineState::Starting;
                            if starting {
                                *s = EngineState::Running;
                            }
                            starting
                        });
                    }
                    Some(ReaderMsg::Event(event)) => {
                        match self.dispatch(event, &mut tracker, &worker_txs, &mut ack_rx, &halt).await {
                            Ok(()) => {}
                            Err(PipelineError::Cancelled) => break,
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    Some(ReaderMsg::Failed(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                },
            }
        }

        halt.cancel();
        drop(reader_rx);
        drop(worker_txs);
        while let Some(msg) = ack_rx.recv().await {
            if let Err(e) = self.on_worker_msg(msg, &mut tracker) {
                failure.get_or_insert(e);
            }
        }
        for task in worker_tasks {
            let _ = task.await;
        }
        let _ = reader.await;

        let final_state = match failure {
            Some(e) => {
                error!(job_id = %self.job_id, "Incremental engine failed: {e}");
                let _ = self.events_tx.send(EngineEvent::Failed(e.report()));
                EngineState::Failed
            }
            None => *self.intent.lock(),
        };
        info!(
            job_id = %self.job_id,
            state = ?final_state,
            applied = ?tracker.safe().map(ToString::to_string),
            "Incremental engine halted"
        );
        self.state_tx.send_replace(final_state);
    }

    async fn dispatch(
        &self,
        event: ChangeEvent,
        tracker: &mut PositionTracker,
        workers: &[mpsc::Sender<Work>],
        acks: &mut mpsc::UnboundedReceiver<WorkerMsg>,
        halt: &CancellationToken,
    ) -> Result<()> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let Some(applier) = self.appliers.get(&event.table) else {
            debug!(job_id = %self.job_id, table = %event.table, "Skipping change of unmapped table");
            let seq = tracker.register(event.position.clone());
            self.advance(tracker.complete(seq), tracker);
            return Ok(());
        };

        let barrier = dispatch::needs_barrier(&event, applier.key_columns());
        let worker = dispatch::worker_for(&event, applier.key_columns(), workers.len());
        if barrier {
            self.drain(tracker, acks, halt).await?;
        }
        let seq = tracker.register(event.position.clone());
        self.counters.in_flight.store(tracker.pending() as u64, Ordering::Relaxed);
        tokio::select! {
            _ = halt.cancelled() => return Err(PipelineError::Cancelled),
            sent = workers[worker].send(Work { seq, event }) => {
                if sent.is_err() {
                    return Err(PipelineError::Cancelled);
                }
            }
        }
        if barrier {
            self.drain(tracker, acks, halt).await?;
        }
        Ok(())
    }

    /// Wait until every dispatched event is applied
    async fn drain(
        &self,
        tracker: &mut PositionTracker,
        acks: &mut mpsc::UnboundedReceiver<WorkerMsg>,
        halt: &CancellationToken,
    ) -> Result<()> {
        while tracker.pending() > 0 {
            tokio::select! {
                _ = halt.cancelled() => return Err(PipelineError::Cancelled),
                msg = acks.recv() => match msg {
                    Some(msg) => self.on_worker_msg(msg, tracker)?,
                    None => return Err(PipelineError::Cancelled),
                },
            }
        }
        Ok(())
    }

    fn on_worker_msg(&self, msg: WorkerMsg, tracker: &mut PositionTracker) -> Result<()> {
        match msg {
            WorkerMsg::Applied { seqs, conflicts } => {
                for report in conflicts {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    metrics::apply_conflict(&self.job_id);
                    warn!(job_id = %self.job_id, "{report}");
                    let _ = self.events_tx.send(EngineEvent::Conflict(report));
                }
                self.counters
                    .applied
                    .fetch_add(seqs.len() as u64, Ordering::Relaxed);
                metrics::events_applied(&self.job_id, seqs.len() as u64);
                let mut advanced = None;
                for seq in seqs {
                    if let Some(position) = tracker.complete(seq) {
                        advanced = Some(position);
                    }
                }
                self.advance(advanced, tracker);
                Ok(())
            }
            WorkerMsg::Failed(e) => Err(e),
        }
    }

    fn advance(&self, advanced: Option<Position>, tracker: &PositionTracker) {
        let pending = tracker.pending();
        self.counters.in_flight.store(pending as u64, Ordering::Relaxed);
        metrics::in_flight(&self.job_id, pending);
        if let Some(position) = advanced {
            debug!(job_id = %self.job_id, position = %position, "Safe position advanced");
            self.applied_tx.send_replace(Some(position));
        }
    }
}

async fn read_changes(
    job_id: String,
    reader: Arc<dyn ChangeStreamReader>,
    from: Option<Position>,
    tx: mpsc::Sender<ReaderMsg>,
    retry: RetryPolicy,
    halt: CancellationToken,
) {
    let mut resume = from;
    // Events already delivered at exactly `resume`
    let mut seen_at_resume = 0usize;
    let mut attempt = 0u32;
    loop {
        let subscribed = tokio::select! {
            _ = halt.cancelled() => return,
            s = reader.subscribe(resume.clone()) => s,
        };
        let failure = match subscribed {
            Ok(mut stream) => {
                if tx.send(ReaderMsg::Subscribed).await.is_err() {
                    return;
                }
                let mut skip = seen_at_resume;
                loop {
                    let next = tokio::select! {
                        _ = halt.cancelled() => return,
                        n = stream.next() => n,
                    };
                    let event = match next {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => break e,
                        None => {
                            break PipelineError::TransientIo(sluice_rdbc::Error::connection(format!(
                                "change stream {} ended",
                                reader.name()
                            )))
                        }
                    };
                    if resume.as_ref().is_some_and(|r| event.position < *r) {
                        continue;
                    }
                    if resume.as_ref() == Some(&event.position) {
                        if skip > 0 {
                            skip -= 1;
                            continue;
                        }
                        seen_at_resume += 1;
                    } else {
                        resume = Some(event.position.clone());
                        seen_at_resume = 1;
                    }
                    attempt = 0;
                    tokio::select! {
                        _ = halt.cancelled() => return,
                        sent = tx.send(ReaderMsg::Event(event)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => e,
        };

        if !failure.is_retriable() || !retry.should_retry(attempt) {
            let e = fatal_apply(&job_id, resume.as_ref(), failure);
            let _ = tx.send(ReaderMsg::Failed(e)).await;
            return;
        }
        let delay = retry.delay_for_attempt(attempt);
        attempt += 1;
        metrics::retry(&job_id, "subscribe");
        warn!(
            job_id = %job_id,
            reader = %reader.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Change stream failed, resubscribing: {failure}"
        );
        tokio::select! {
            _ = halt.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_worker(
    worker: usize,
    job_id: String,
    mut rx: mpsc::Receiver<Work>,
    acks: mpsc::UnboundedSender<WorkerMsg>,
    appliers: Arc<TableAppliers>,
    batch_size: usize,
    retry: RetryPolicy,
    halt: CancellationToken,
) {
    let appliers: &TableAppliers = &appliers;
    while let Some(first) = rx.recv().await {
        let mut seqs = vec![first.seq];
        let mut events = vec![first.event];
        while events.len() < batch_size {
            match rx.try_recv() {
                Ok(work) => {
                    seqs.push(work.seq);
                    events.push(work.event);
                }
                Err(_) => break,
            }
        }

        let started = Instant::now();
        let batch: &[ChangeEvent] = &events;
        let job: &str = &job_id;
        let mut attempts = 0u32;
        let result = retry
            .run("apply batch", &halt, move || {
                attempts += 1;
                if attempts > 1 {
                    metrics::retry(job, "apply");
                }
                apply::apply_events(batch, move |t: &TableName| appliers.get(t))
            })
            .await;

        match result {
            Ok(conflicts) => {
                metrics::apply_batch(&job_id, started.elapsed().as_secs_f64() * 1000.0);
                debug!(job_id = %job_id, worker, events = events.len(), "Applied batch");
                let conflicts = conflicts
                    .into_iter()
                    .map(|c| {
                        ErrorReport::new(
                            ErrorClass::ConflictWarning,
                            format!(
                                "{} change of {} at {} matched {} rows in {}",
                                events[c.event_index].op,
                                c.table,
                                events[c.event_index].position,
                                c.affected,
                                c.node
                            ),
                        )
                    })
                    .collect();
                if acks.send(WorkerMsg::Applied { seqs, conflicts }).is_err() {
                    return;
                }
            }
            Err(PipelineError::Cancelled) => return,
            Err(e) => {
                let e = fatal_apply(&job_id, events.first().map(|e| &e.position), e);
                let _ = acks.send(WorkerMsg::Failed(e));
                return;
            }
        }
    }
}
