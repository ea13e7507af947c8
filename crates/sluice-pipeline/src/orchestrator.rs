//! # Job orchestrator
//!
//! Drives one migration job through its lifecycle and persists every step:
//!
//! ```text
//! PREPARING ─▶ SPLITTING ─▶ COPYING ─▶ INCREMENTAL_RUNNING ─▶ READY_FOR_CUTOVER ─▶ FINISHED
//!      │            │           │               │                     │
//!      └────────────┴───────────┴───────┬───────┴─────────────────────┘
//!                                       ▼
//!                          PAUSED / STOPPED / FAILED ──resume──▶ (state it left)
//! ```
//!
//! - **Preparing**: pre-flight checks, then the change stream position of
//!   every source is captured as the snapshot watermark
//! - **Splitting**: every mapped table is cut into splits
//! - **Copying**: splits are copied concurrently; each committed batch
//!   advances the split cursor in the checkpoint
//! - **Incremental**: one engine per source applies changes from the
//!   watermark (or the last applied position); every advance of the safe
//!   position is persisted before the reader is acknowledged
//! - **Ready for cutover**: every source's applied position has reached the
//!   source's current position; changes keep being applied until `cutover`
//!
//! The orchestrator is the only writer of the job checkpoint and holds the
//! job lease while it runs. Component results reach it over channels, so no
//! lock is held across I/O.

use chrono::Utc;
use parking_lot::Mutex;
use sluice_rdbc::store::TableStore;
use sluice_rdbc::types::TableMetadata;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use async_trait::async_trait;

use crate::algorithm::AlgorithmRegistry;
use crate::checkpoint::{CheckpointStore, JobCheckpoint};
use crate::config::{JobConfig, PipelineSettings};
use crate::consistency::{wait_for_drain, ConsistencyChecker, ConsistencyReport, VerifyMode};
use crate::control::{ControlCommand, ControlFile};
use crate::copier::{ProgressSink, SnapshotCopier};
use crate::error::{ErrorClass, ErrorReport, PipelineError, Result};
use crate::incremental::{EngineEvent, EngineHandle, IncrementalEngine, TableApplier, TableAppliers};
use crate::job::{JobState, JobStatus};
use crate::lease::JobLease;
use crate::metrics;
use crate::position::Position;
use crate::precheck::{CheckReport, CompatibilityChecker, StoreMap};
use crate::routing::{DataNode, SourceTable, TableRouter, TableRule};
use crate::split::{split_table, TaskSplit};
use crate::stream::ChangeStreamReader;

/// Readiness and engine health poll period
const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Datasources and change streams a job runs against
#[derive(Clone, Default)]
pub struct Datasources {
    sources: StoreMap,
    targets: StoreMap,
    streams: BTreeMap<String, Arc<dyn ChangeStreamReader>>,
}

impl fmt::Debug for Datasources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datasources")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Datasources {
    /// No datasources
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source datasource and its change stream
    pub fn with_source(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn TableStore>,
        stream: Arc<dyn ChangeStreamReader>,
    ) -> Self {
        let name = name.into();
        self.streams.insert(name.clone(), stream);
        self.sources.insert(name, store);
        self
    }

    /// Add a source datasource without a change stream; such a job cannot
    /// leave the snapshot phase
    pub fn with_snapshot_source(mut self, name: impl Into<String>, store: Arc<dyn TableStore>) -> Self {
        self.sources.insert(name.into(), store);
        self
    }

    /// Add a target datasource
    pub fn with_target(mut self, name: impl Into<String>, store: Arc<dyn TableStore>) -> Self {
        self.targets.insert(name.into(), store);
        self
    }

    /// Source datasources
    pub fn sources(&self) -> &StoreMap {
        &self.sources
    }

    /// Target datasources
    pub fn targets(&self) -> &StoreMap {
        &self.targets
    }

    fn source(&self, name: &str) -> Result<&Arc<dyn TableStore>> {
        self.sources
            .get(name)
            .ok_or_else(|| PipelineError::config(format!("unknown source datasource '{name}'")))
    }

    fn stream(&self, name: &str) -> Result<&Arc<dyn ChangeStreamReader>> {
        self.streams
            .get(name)
            .ok_or_else(|| PipelineError::config(format!("source datasource '{name}' has no change stream reader")))
    }

    fn target_map(&self) -> HashMap<String, Arc<dyn TableStore>> {
        self.targets
            .iter()
            .map(|(name, store)| (name.clone(), store.clone()))
            .collect()
    }
}

/// What a job migrates and how
#[derive(Debug, Clone)]
pub struct JobDefinition {
    /// Job id
    pub job_id: String,
    /// Table rules
    pub rules: Vec<TableRule>,
    /// Tuning
    pub settings: PipelineSettings,
}

impl JobDefinition {
    /// Job with default settings
    pub fn new(job_id: impl Into<String>, rules: Vec<TableRule>) -> Self {
        Self {
            job_id: job_id.into(),
            rules,
            settings: PipelineSettings::default(),
        }
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Definition of a job file
    pub fn from_config(config: &JobConfig) -> Result<Self> {
        Ok(Self {
            job_id: config.job_id.clone(),
            rules: config.rules()?,
            settings: config.pipeline.clone(),
        })
    }

    /// Every data node of every rule
    pub fn data_nodes(&self) -> Vec<DataNode> {
        let mut nodes: Vec<DataNode> = self.rules.iter().flat_map(|r| r.data_nodes.iter().cloned()).collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn source_datasources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.iter().map(|r| r.source.datasource.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// A mapped table, resolved against its datasources
struct TablePlan {
    metadata: TableMetadata,
    applier: TableApplier,
}

impl TablePlan {
    fn source(&self) -> &SourceTable {
        self.applier.router().source()
    }
}

/// Result of one lifecycle phase
enum Step {
    /// Move on to the next state
    Continue(JobState),
    /// Operator requested halt (or cutover)
    Halt(JobState),
    /// The job failed
    Fail(ErrorReport),
}

struct SplitProgress {
    split: TaskSplit,
    ack: oneshot::Sender<Result<()>>,
}

/// Hands split progress to the orchestrator and waits until it is durable
struct ChannelSink {
    tx: mpsc::Sender<SplitProgress>,
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn record(&self, split: &TaskSplit) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SplitProgress {
                split: split.clone(),
                ack,
            })
            .await
            .map_err(|_| PipelineError::Cancelled)?;
        done.await.map_err(|_| PipelineError::Cancelled)?
    }
}

type AppliedReceivers = Arc<Mutex<BTreeMap<String, watch::Receiver<Option<Position>>>>>;

/// Handle of an in-process run
struct RunningJob {
    commands: mpsc::Sender<ControlCommand>,
    applied: AppliedReceivers,
    done: watch::Receiver<()>,
}

/// Clears the running slot and stops background tasks when a run ends,
/// including when its future is dropped
struct RunGuard<'a> {
    slot: &'a Mutex<Option<RunningJob>>,
    tasks: Vec<JoinHandle<()>>,
    _done: watch::Sender<()>,
    _scope: DropGuard,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct RunContext {
    lease: Arc<Mutex<JobLease>>,
    commands: mpsc::Receiver<ControlCommand>,
    cancel: CancellationToken,
    scope: CancellationToken,
    lease_lost: CancellationToken,
    applied: AppliedReceivers,
}

impl RunContext {
    fn lease(&self) -> JobLease {
        self.lease.lock().clone()
    }

    fn lease_lost_error(&self) -> PipelineError {
        PipelineError::checkpoint(format!("lease of job {} was lost", self.lease.lock().job_id))
    }

    /// Halt requested while no phase was listening
    fn pending_halt(&mut self) -> Option<JobState> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ControlCommand::Pause => return Some(JobState::Paused),
                ControlCommand::Stop => return Some(JobState::Stopped),
                ControlCommand::Cutover => warn!("Ignoring cutover: job is not ready for cutover"),
            }
        }
        self.cancel.is_cancelled().then_some(JobState::Paused)
    }
}

struct RunningEngine {
    datasource: String,
    stream: Arc<dyn ChangeStreamReader>,
    handle: EngineHandle,
    persisted: Option<Position>,
}

/// State a halted job resumes into
fn resume_point(state: JobState) -> JobState {
    match state {
        JobState::ReadyForCutover => JobState::IncrementalRunning,
        other => other,
    }
}

fn halt_target(command: ControlCommand) -> Option<JobState> {
    match command {
        ControlCommand::Pause => Some(JobState::Paused),
        ControlCommand::Stop => Some(JobState::Stopped),
        ControlCommand::Cutover => None,
    }
}

/// Errors that leave the checkpoint unwritable
fn is_ownership_error(e: &PipelineError) -> bool {
    matches!(e.class(), ErrorClass::LeaseHeld | ErrorClass::Checkpoint)
}

/// Runs and administers one migration job
pub struct JobOrchestrator {
    job: JobDefinition,
    datasources: Datasources,
    store: Arc<dyn CheckpointStore>,
    registry: AlgorithmRegistry,
    checker: CompatibilityChecker,
    owner: String,
    control: Option<ControlFile>,
    running: Mutex<Option<RunningJob>>,
}

impl fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("job_id", &self.job.job_id)
            .field("owner", &self.owner)
            .field("datasources", &self.datasources)
            .field("running", &self.is_running())
            .finish()
    }
}

impl JobOrchestrator {
    /// Orchestrator of `job` with a random owner identity
    pub fn new(job: JobDefinition, datasources: Datasources, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            job,
            datasources,
            store,
            registry: AlgorithmRegistry::builtin(),
            checker: CompatibilityChecker::builtin(),
            owner: format!("sluice-{}", Uuid::new_v4()),
            control: None,
            running: Mutex::new(None),
        }
    }

    /// Lease owner identity; a restarted process reusing it takes over its
    /// own lease without waiting for expiry
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Replace the algorithm registry
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the compatibility checker
    pub fn with_checker(mut self, checker: CompatibilityChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Poll `control` for commands while running, and leave commands there
    /// for another process holding the lease
    pub fn with_control_file(mut self, control: ControlFile) -> Self {
        self.control = Some(control);
        self
    }

    /// Job id
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    /// Lease owner identity
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether this orchestrator is running the job right now
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn settings(&self) -> &PipelineSettings {
        &self.job.settings
    }

    fn not_found(&self) -> PipelineError {
        PipelineError::JobNotFound(self.job.job_id.clone())
    }

    async fn load(&self) -> Result<JobCheckpoint> {
        self.store
            .load(&self.job.job_id)
            .await?
            .ok_or_else(|| self.not_found())
    }

    async fn acquire_lease(&self) -> Result<JobLease> {
        self.store
            .acquire_lease(&self.job.job_id, &self.owner, self.settings().lease.ttl())
            .await
    }

    async fn release_lease(&self, lease: &JobLease) {
        if let Err(e) = self.store.release_lease(lease).await {
            warn!(job_id = %self.job.job_id, "Failed to release job lease: {e}");
        }
    }

    async fn save(&self, checkpoint: &mut JobCheckpoint, lease: &JobLease) -> Result<()> {
        checkpoint.updated_at = Utc::now();
        checkpoint.lease_epoch = lease.epoch;
        self.store.save(checkpoint, lease).await
    }

    async fn transition(&self, checkpoint: &mut JobCheckpoint, lease: &JobLease, to: JobState) -> Result<()> {
        let from = checkpoint.state;
        if !from.can_transition_to(to) {
            return Err(PipelineError::invalid_transition(
                &self.job.job_id,
                format!("move to {to}"),
                from,
            ));
        }
        checkpoint.state = to;
        if let Err(e) = self.save(checkpoint, lease).await {
            checkpoint.state = from;
            return Err(e);
        }
        metrics::state_transition(&self.job.job_id, to.as_str());
        info!(job_id = %self.job.job_id, from = %from, to = %to, "Job state changed");
        Ok(())
    }

    async fn halt(&self, checkpoint: &mut JobCheckpoint, lease: &JobLease, to: JobState) -> Result<()> {
        match to {
            JobState::Paused | JobState::Stopped if checkpoint.state.is_active() => {
                checkpoint.resume_state = Some(resume_point(checkpoint.state));
            }
            JobState::Finished => checkpoint.resume_state = None,
            _ => {}
        }
        self.transition(checkpoint, lease, to).await
    }

    async fn fail(&self, checkpoint: &mut JobCheckpoint, lease: &JobLease, report: ErrorReport) -> Result<()> {
        error!(
            job_id = %self.job.job_id,
            state = %checkpoint.state,
            class = %report.class,
            code = report.code,
            "Job failed: {}",
            report.message
        );
        if checkpoint.state.is_active() {
            checkpoint.resume_state = Some(resume_point(checkpoint.state));
        }
        checkpoint.last_error = Some(report);
        self.transition(checkpoint, lease, JobState::Failed).await
    }

    /// Register the job: a `PREPARING` checkpoint
    pub async fn create(&self) -> Result<JobStatus> {
        let lease = self.acquire_lease().await?;
        let result = async {
            if self.store.load(&self.job.job_id).await?.is_some() {
                return Err(PipelineError::JobAlreadyExists(self.job.job_id.clone()));
            }
            let mut checkpoint = JobCheckpoint::new(&self.job.job_id);
            self.save(&mut checkpoint, &lease).await?;
            metrics::state_transition(&self.job.job_id, JobState::Preparing.as_str());
            info!(job_id = %self.job.job_id, tables = self.job.rules.len(), "Created job");
            Ok(JobStatus::from_checkpoint(&checkpoint, false))
        }
        .await;
        self.release_lease(&lease).await;
        result
    }

    /// Run the job from where its checkpoint stands, creating it if needed.
    ///
    /// Returns once the job halts: finished, paused, stopped or failed. A
    /// job failure is reported in the returned status; `Err` means the job
    /// could not be driven at all (lease, checkpoint, state). Cancelling
    /// `cancel` pauses the job.
    pub async fn start(&self, cancel: CancellationToken) -> Result<JobStatus> {
        self.run(cancel, false).await
    }

    /// Continue a paused, stopped or failed job from the state it left
    pub async fn resume(&self, cancel: CancellationToken) -> Result<JobStatus> {
        self.run(cancel, true).await
    }

    fn enter(&self, commands: mpsc::Sender<ControlCommand>, scope: &CancellationToken) -> Result<(RunGuard<'_>, AppliedReceivers)> {
        let mut slot = self.running.lock();
        if slot.is_some() {
            return Err(PipelineError::invalid_transition(
                &self.job.job_id,
                "start",
                "RUNNING in this process",
            ));
        }
        let applied = AppliedReceivers::default();
        let (done_tx, done) = watch::channel(());
        *slot = Some(RunningJob {
            commands,
            applied: applied.clone(),
            done,
        });
        Ok((
            RunGuard {
                slot: &self.running,
                tasks: Vec::new(),
                _done: done_tx,
                _scope: scope.clone().drop_guard(),
            },
            applied,
        ))
    }

    async fn run(&self, cancel: CancellationToken, resume: bool) -> Result<JobStatus> {
        let job_id = self.job.job_id.clone();
        let scope = CancellationToken::new();
        let (commands_tx, commands) = mpsc::channel(16);
        let (mut guard, applied) = self.enter(commands_tx.clone(), &scope)?;

        let lease = self.acquire_lease().await?;
        let outcome = async {
            let mut checkpoint = match self.store.load(&job_id).await? {
                Some(cp) => cp,
                None if !resume => {
                    let mut cp = JobCheckpoint::new(&job_id);
                    self.save(&mut cp, &lease).await?;
                    metrics::state_transition(&job_id, JobState::Preparing.as_str());
                    info!(job_id = %job_id, "Created job");
                    cp
                }
                None => return Err(self.not_found()),
            };

            if resume {
                if !checkpoint.state.is_resumable() {
                    return Err(PipelineError::invalid_transition(&job_id, "resume", checkpoint.state));
                }
                let to = checkpoint.resume_state.take().unwrap_or(JobState::Preparing);
                self.transition(&mut checkpoint, &lease, to).await?;
            } else if !checkpoint.state.is_active() {
                return Err(PipelineError::invalid_transition(&job_id, "start", checkpoint.state));
            }

            if let Some(control) = &self.control {
                control.clear().await?;
            }

            let shared_lease = Arc::new(Mutex::new(lease.clone()));
            let lease_lost = scope.child_token();
            guard
                .tasks
                .push(self.spawn_lease_renewal(shared_lease.clone(), lease_lost.clone(), scope.clone()));
            if let Some(control) = self.control.clone() {
                guard
                    .tasks
                    .push(spawn_control_poller(control, commands_tx, self.settings().state.control_poll_interval(), scope.clone()));
            }

            let mut ctx = RunContext {
                lease: shared_lease,
                commands,
                cancel,
                scope: scope.clone(),
                lease_lost,
                applied,
            };
            info!(job_id = %job_id, owner = %self.owner, state = %checkpoint.state, "Running job");
            self.drive(&mut checkpoint, &mut ctx).await?;
            Ok(JobStatus::from_checkpoint(&checkpoint, false))
        }
        .await;

        scope.cancel();
        self.release_lease(&lease).await;
        drop(guard);
        outcome
    }

    fn spawn_lease_renewal(
        &self,
        lease: Arc<Mutex<JobLease>>,
        lost: CancellationToken,
        scope: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let config = self.settings().lease.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.renew_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let current = lease.lock().clone();
                match store.renew_lease(&current, config.ttl()).await {
                    Ok(renewed) => {
                        debug!(job_id = %renewed.job_id, expires_at = %renewed.expires_at, "Renewed job lease");
                        *lease.lock() = renewed;
                    }
                    Err(e) => {
                        error!(job_id = %current.job_id, "Lost job lease: {e}");
                        lost.cancel();
                        break;
                    }
                }
            }
        })
    }

    async fn drive(&self, checkpoint: &mut JobCheckpoint, ctx: &mut RunContext) -> Result<()> {
        let mut plans: Option<Vec<TablePlan>> = None;
        loop {
            if ctx.lease_lost.is_cancelled() {
                return Err(ctx.lease_lost_error());
            }
            if !checkpoint.state.is_active() {
                return Ok(());
            }
            if let Some(to) = ctx.pending_halt() {
                return self.halt(checkpoint, &ctx.lease(), to).await;
            }

            if plans.is_none() && checkpoint.state != JobState::Preparing {
                match self.plan_tables().await {
                    Ok(p) => plans = Some(p),
                    Err(e) if is_ownership_error(&e) => return Err(e),
                    Err(e) => return self.fail(checkpoint, &ctx.lease(), e.report()).await,
                }
            }
            let tables = plans.as_deref().unwrap_or_default();

            let step = match checkpoint.state {
                JobState::Preparing => self.prepare(checkpoint).await,
                JobState::Splitting => self.split(checkpoint, tables).await,
                JobState::Copying => self.copy(checkpoint, ctx, tables).await,
                JobState::IncrementalRunning | JobState::ReadyForCutover => {
                    self.incremental(checkpoint, ctx, tables).await
                }
                _ => return Ok(()),
            };

            match step {
                Ok(Step::Continue(next)) => self.transition(checkpoint, &ctx.lease(), next).await?,
                Ok(Step::Halt(to)) => return self.halt(checkpoint, &ctx.lease(), to).await,
                Ok(Step::Fail(report)) => return self.fail(checkpoint, &ctx.lease(), report).await,
                Err(e) if is_ownership_error(&e) => return Err(e),
                Err(e) => return self.fail(checkpoint, &ctx.lease(), e.report()).await,
            }
        }
    }

    async fn plan_tables(&self) -> Result<Vec<TablePlan>> {
        let targets = self.datasources.target_map();
        let mut plans = Vec::with_capacity(self.job.rules.len());
        for rule in &self.job.rules {
            let store = self.datasources.source(&rule.source.datasource)?;
            let metadata = store
                .table_metadata(&rule.source.table)
                .await
                .map_err(PipelineError::from_database)?;
            if metadata.primary_key_names().is_empty() {
                warn!(job_id = %self.job.job_id, table = %rule.source, "Table has no primary key; exact duplicate rows are stored once");
            }
            let router = TableRouter::new(rule.clone(), &self.registry)?;
            let applier = TableApplier::new(router, metadata.primary_key_names(), &targets)?;
            plans.push(TablePlan { metadata, applier });
        }
        Ok(plans)
    }

    /// Run the pre-flight checks of this job
    pub async fn precheck(&self) -> Result<CheckReport> {
        self.checker
            .check(
                self.datasources.sources(),
                self.datasources.targets(),
                &self.job.data_nodes(),
            )
            .await
    }

    async fn prepare(&self, checkpoint: &mut JobCheckpoint) -> Result<Step> {
        let report = match self.precheck().await {
            Ok(report) => report,
            Err(e) => return Ok(Step::Fail(e.report())),
        };
        debug!(job_id = %self.job.job_id, checks = report.passed.len(), "Pre-flight checks passed");
        // Rules and table metadata must resolve before any watermark is taken
        if let Err(e) = self.plan_tables().await {
            return Ok(Step::Fail(e.report()));
        }

        let mut watermarks = BTreeMap::new();
        for datasource in self.job.source_datasources() {
            let stream = self.datasources.stream(&datasource)?;
            let position = stream.prepare().await?;
            info!(job_id = %self.job.job_id, datasource = %datasource, position = %position, "Captured snapshot watermark");
            watermarks.insert(datasource, position);
        }
        checkpoint.snapshot_watermarks = watermarks;
        checkpoint.incremental_positions.clear();
        checkpoint.splits.clear();
        Ok(Step::Continue(JobState::Splitting))
    }

    async fn split(&self, checkpoint: &mut JobCheckpoint, plans: &[TablePlan]) -> Result<Step> {
        let parallelism = self.settings().copy.parallelism;
        let mut splits = Vec::new();
        for plan in plans {
            let store = self.datasources.source(&plan.source().datasource)?;
            let table_splits = split_table(store.as_ref(), plan.source(), &plan.metadata, parallelism).await?;
            debug!(job_id = %self.job.job_id, table = %plan.source(), splits = table_splits.len(), "Split table");
            splits.extend(table_splits);
        }
        info!(job_id = %self.job.job_id, splits = splits.len(), "Split tables");
        checkpoint.splits = splits;
        Ok(Step::Continue(JobState::Copying))
    }

    async fn copy(&self, checkpoint: &mut JobCheckpoint, ctx: &mut RunContext, plans: &[TablePlan]) -> Result<Step> {
        let settings = self.settings();
        let mut copiers: HashMap<SourceTable, Arc<SnapshotCopier>> = HashMap::new();
        for plan in plans {
            let source = self.datasources.source(&plan.source().datasource)?.clone();
            let copier = SnapshotCopier::new(&self.job.job_id, source, plan.applier.clone(), settings.retry.clone())
                .with_batch_size(settings.copy.batch_size);
            copiers.insert(plan.source().clone(), Arc::new(copier));
        }

        let mut pending: VecDeque<(TaskSplit, Arc<SnapshotCopier>)> = VecDeque::new();
        for split in checkpoint.splits.iter().filter(|s| !s.completed) {
            let copier = copiers.get(&split.table).cloned().ok_or_else(|| {
                PipelineError::config(format!("split {} belongs to unmapped table {}", split.split_id, split.table))
            })?;
            pending.push_back((split.clone(), copier));
        }
        info!(
            job_id = %self.job.job_id,
            pending = pending.len(),
            total = checkpoint.splits.len(),
            "Copying snapshot"
        );

        let concurrency = settings.copy.concurrency.max(1);
        let copy_cancel = ctx.scope.child_token();
        let (progress_tx, mut progress_rx) = mpsc::channel::<SplitProgress>(concurrency * 2);
        let mut tasks = JoinSet::new();
        let mut halt: Option<JobState> = None;
        let mut failure: Option<PipelineError> = None;

        loop {
            while tasks.len() < concurrency && halt.is_none() && failure.is_none() {
                let Some((split, copier)) = pending.pop_front() else {
                    break;
                };
                let sink = ChannelSink {
                    tx: progress_tx.clone(),
                };
                let token = copy_cancel.clone();
                tasks.spawn(async move { copier.copy(split, &sink, &token).await });
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some(progress) = progress_rx.recv() => {
                    checkpoint.update_split(&progress.split);
                    let saved = self.save(checkpoint, &ctx.lease()).await;
                    let reply = match &saved {
                        Ok(()) => Ok(()),
                        Err(e) => Err(PipelineError::checkpoint(e.to_string())),
                    };
                    let _ = progress.ack.send(reply);
                    if let Err(e) = saved {
                        failure.get_or_insert(e);
                        copy_cancel.cancel();
                    }
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(result)) => debug!(
                        job_id = %self.job.job_id,
                        split_id = %result.split.split_id,
                        rows = result.rows_copied,
                        completed = result.completed,
                        "Copy task ended"
                    ),
                    Ok(Err(PipelineError::Cancelled)) => {}
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                        copy_cancel.cancel();
                    }
                    Err(e) => {
                        failure.get_or_insert(PipelineError::FatalCopy {
                            job_id: self.job.job_id.clone(),
                            split_id: String::new(),
                            message: format!("copy task aborted: {e}"),
                        });
                        copy_cancel.cancel();
                    }
                },
                Some(command) = ctx.commands.recv(), if halt.is_none() => match halt_target(command) {
                    Some(to) => {
                        info!(job_id = %self.job.job_id, %command, "Halting snapshot copy");
                        halt = Some(to);
                        copy_cancel.cancel();
                    }
                    None => warn!(job_id = %self.job.job_id, "Ignoring cutover: snapshot copy in progress"),
                },
                _ = ctx.cancel.cancelled(), if halt.is_none() => {
                    halt = Some(JobState::Paused);
                    copy_cancel.cancel();
                }
                _ = ctx.lease_lost.cancelled(), if failure.is_none() => {
                    failure = Some(ctx.lease_lost_error());
                    copy_cancel.cancel();
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if let Some(to) = halt {
            return Ok(Step::Halt(to));
        }
        if !checkpoint.snapshot_complete() {
            return Err(PipelineError::FatalCopy {
                job_id: self.job.job_id.clone(),
                split_id: String::new(),
                message: "copy ended with incomplete splits".to_string(),
            });
        }
        let rows: u64 = checkpoint.splits.iter().map(|s| s.rows_copied).sum();
        info!(job_id = %self.job.job_id, rows, splits = checkpoint.splits.len(), "Snapshot copy complete");
        Ok(Step::Continue(JobState::IncrementalRunning))
    }

    fn start_engines(&self, checkpoint: &JobCheckpoint, ctx: &RunContext, plans: &[TablePlan]) -> Result<Vec<RunningEngine>> {
        let settings = self.settings();
        let mut by_source: BTreeMap<String, TableAppliers> = BTreeMap::new();
        for plan in plans {
            by_source
                .entry(plan.source().datasource.clone())
                .or_default()
                .insert(plan.source().table.clone(), plan.applier.clone());
        }

        let mut engines = Vec::with_capacity(by_source.len());
        for (datasource, appliers) in by_source {
            let stream = self.datasources.stream(&datasource)?.clone();
            let from = checkpoint
                .incremental_positions
                .get(&datasource)
                .or_else(|| checkpoint.snapshot_watermarks.get(&datasource))
                .cloned();
            let engine = IncrementalEngine::new(
                &self.job.job_id,
                stream.clone(),
                Arc::new(appliers),
                settings.incremental.clone(),
                settings.retry.clone(),
            );
            let handle = engine.start(from.clone(), ctx.scope.child_token());
            ctx.applied
                .lock()
                .insert(datasource.clone(), handle.applied_receiver());
            engines.push(RunningEngine {
                datasource,
                stream,
                handle,
                persisted: from,
            });
        }
        Ok(engines)
    }

    fn refresh_counters(checkpoint: &mut JobCheckpoint, engines: &[RunningEngine], base: (u64, u64)) {
        let (applied, conflicts) = engines.iter().fold((0, 0), |(a, c), e| {
            let stats = e.handle.stats();
            (a + stats.applied, c + stats.conflicts)
        });
        checkpoint.events_applied = base.0 + applied;
        checkpoint.conflicts = base.1 + conflicts;
    }

    /// Persist the safe position of engine `idx`, then acknowledge it
    async fn persist_position(
        &self,
        checkpoint: &mut JobCheckpoint,
        lease: &JobLease,
        engines: &mut [RunningEngine],
        idx: usize,
        base: (u64, u64),
    ) -> Result<()> {
        let Some(position) = engines[idx].handle.applied() else {
            return Ok(());
        };
        if engines[idx].persisted.as_ref() == Some(&position) {
            return Ok(());
        }
        Self::refresh_counters(checkpoint, engines, base);
        let engine = &mut engines[idx];
        checkpoint
            .incremental_positions
            .insert(engine.datasource.clone(), position.clone());
        self.save(checkpoint, lease).await?;
        engine.persisted = Some(position.clone());
        debug!(job_id = %self.job.job_id, datasource = %engine.datasource, position = %position, "Persisted applied position");
        if let Err(e) = engine.stream.acknowledge(&position).await {
            warn!(job_id = %self.job.job_id, datasource = %engine.datasource, "Failed to acknowledge position: {e}");
        }
        Ok(())
    }

    async fn all_drained(&self, engines: &[RunningEngine]) -> bool {
        for engine in engines {
            let drained = async {
                let target = engine.stream.drain_target().await?;
                engine.stream.is_drained(&target, engine.persisted.as_ref()).await
            }
            .await;
            match drained {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    debug!(job_id = %self.job.job_id, datasource = %engine.datasource, "Cannot check lag: {e}");
                    return false;
                }
            }
        }
        true
    }

    async fn incremental(
        &self,
        checkpoint: &mut JobCheckpoint,
        ctx: &mut RunContext,
        plans: &[TablePlan],
    ) -> Result<Step> {
        let mut engines = self.start_engines(checkpoint, ctx, plans)?;
        let base = (checkpoint.events_applied, checkpoint.conflicts);
        info!(job_id = %self.job.job_id, engines = engines.len(), state = %checkpoint.state, "Applying change streams");

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel::<usize>();
        let mut forwarders = JoinSet::new();
        for (idx, engine) in engines.iter().enumerate() {
            let mut applied = engine.handle.applied_receiver();
            let tx = changed_tx.clone();
            forwarders.spawn(async move {
                while applied.changed().await.is_ok() {
                    if tx.send(idx).is_err() {
                        break;
                    }
                }
            });
        }
        drop(changed_tx);

        let mut tick = tokio::time::interval(PROGRESS_TICK);
        let mut failure: Option<ErrorReport> = None;
        let outcome: Result<Step> = loop {
            tokio::select! {
                Some(idx) = changed_rx.recv() => {
                    if let Err(e) = self.persist_position(checkpoint, &ctx.lease(), &mut engines, idx, base).await {
                        break Err(e);
                    }
                }
                _ = tick.tick() => {
                    for engine in engines.iter_mut() {
                        while let Some(event) = engine.handle.try_next_event() {
                            match event {
                                EngineEvent::Conflict(report) => checkpoint.last_error = Some(report),
                                EngineEvent::Failed(report) => failure = Some(report),
                            }
                        }
                    }
                    if let Some(report) = failure.take() {
                        break Ok(Step::Fail(report));
                    }
                    if checkpoint.state == JobState::IncrementalRunning && self.all_drained(&engines).await {
                        Self::refresh_counters(checkpoint, &engines, base);
                        if let Err(e) = self.transition(checkpoint, &ctx.lease(), JobState::ReadyForCutover).await {
                            break Err(e);
                        }
                    }
                }
                Some(command) = ctx.commands.recv() => match command {
                    ControlCommand::Pause => break Ok(Step::Halt(JobState::Paused)),
                    ControlCommand::Stop => break Ok(Step::Halt(JobState::Stopped)),
                    ControlCommand::Cutover if checkpoint.state == JobState::ReadyForCutover => {
                        break Ok(Step::Halt(JobState::Finished));
                    }
                    ControlCommand::Cutover => {
                        warn!(job_id = %self.job.job_id, "Ignoring cutover: change streams are not drained");
                    }
                },
                _ = ctx.cancel.cancelled() => break Ok(Step::Halt(JobState::Paused)),
                _ = ctx.lease_lost.cancelled() => break Err(ctx.lease_lost_error()),
            }
        };

        let pause = matches!(outcome, Ok(Step::Halt(JobState::Paused)));
        for engine in &engines {
            if pause {
                engine.handle.pause();
            } else {
                engine.handle.stop();
            }
        }
        let mut engine_failure = None;
        for engine in engines.iter_mut() {
            while let Some(event) = engine.handle.next_event().await {
                match event {
                    EngineEvent::Conflict(report) => checkpoint.last_error = Some(report),
                    EngineEvent::Failed(report) => engine_failure = Some(report),
                }
            }
        }
        forwarders.abort_all();
        ctx.applied.lock().clear();

        Self::refresh_counters(checkpoint, &engines, base);
        let mut finals = Vec::with_capacity(engines.len());
        for engine in engines {
            let applied = engine.handle.applied();
            let state = engine.handle.join().await;
            debug!(job_id = %self.job.job_id, datasource = %engine.datasource, ?state, "Engine halted");
            if let Some(position) = applied {
                checkpoint
                    .incremental_positions
                    .insert(engine.datasource.clone(), position.clone());
                finals.push((engine.stream, position));
            }
        }

        let step = outcome?;
        self.save(checkpoint, &ctx.lease()).await?;
        for (stream, position) in finals {
            if let Err(e) = stream.acknowledge(&position).await {
                warn!(job_id = %self.job.job_id, reader = %stream.name(), "Failed to acknowledge position: {e}");
            }
        }
        match (step, engine_failure) {
            (Step::Fail(report), _) => Ok(Step::Fail(report)),
            (_, Some(report)) => Ok(Step::Fail(report)),
            (step, None) => Ok(step),
        }
    }

    fn running_handle(&self) -> Option<(mpsc::Sender<ControlCommand>, watch::Receiver<()>)> {
        self.running
            .lock()
            .as_ref()
            .map(|r| (r.commands.clone(), r.done.clone()))
    }

    async fn request(&self, command: ControlCommand) -> Result<JobStatus> {
        if command == ControlCommand::Cutover {
            let status = self.status().await?;
            if status.state != JobState::ReadyForCutover {
                return Err(PipelineError::invalid_transition(&self.job.job_id, "cut over", status.state));
            }
        }

        if let Some((commands, _)) = self.running_handle() {
            commands.send(command).await.map_err(|_| PipelineError::Cancelled)?;
            info!(job_id = %self.job.job_id, %command, "Requested running job");
            return self.status().await;
        }

        let lease = match self.acquire_lease().await {
            Ok(lease) => lease,
            Err(e @ PipelineError::LeaseHeld { .. }) => {
                return match &self.control {
                    Some(control) => {
                        control.send(command).await?;
                        self.status().await
                    }
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        };
        let result = async {
            let mut checkpoint = self.load().await?;
            let to = match command {
                ControlCommand::Pause => JobState::Paused,
                ControlCommand::Stop => JobState::Stopped,
                ControlCommand::Cutover => JobState::Finished,
            };
            self.halt(&mut checkpoint, &lease, to).await?;
            Ok(JobStatus::from_checkpoint(&checkpoint, false))
        }
        .await;
        self.release_lease(&lease).await;
        result
    }

    /// Pause the job; `resume` continues it
    pub async fn pause(&self) -> Result<JobStatus> {
        self.request(ControlCommand::Pause).await
    }

    /// Stop the job
    pub async fn stop(&self) -> Result<JobStatus> {
        self.request(ControlCommand::Stop).await
    }

    /// Stop applying changes and finish a job that is ready for cutover
    pub async fn cutover(&self) -> Result<JobStatus> {
        self.request(ControlCommand::Cutover).await
    }

    async fn wait_until_idle(&self) {
        if let Some((commands, mut done)) = self.running_handle() {
            let _ = commands.send(ControlCommand::Stop).await;
            while done.changed().await.is_ok() {}
        }
    }

    /// Stop the job, delete every target row it wrote, and start over at
    /// `PREPARING`
    pub async fn rollback(&self) -> Result<JobStatus> {
        self.wait_until_idle().await;
        let lease = self.acquire_lease().await?;
        let result = async {
            let previous = self.load().await?;
            for node in self.job.data_nodes() {
                let store = self.datasources.targets().get(&node.datasource).ok_or_else(|| {
                    PipelineError::config(format!("data node {node} names unknown target datasource"))
                })?;
                let deleted = store.clear(&node.table).await.map_err(PipelineError::from_database)?;
                info!(job_id = %self.job.job_id, node = %node, rows = deleted, "Cleared data node");
            }
            self.store.delete(&self.job.job_id, &lease).await?;
            let mut checkpoint = JobCheckpoint::new(&self.job.job_id);
            checkpoint.created_at = previous.created_at;
            self.save(&mut checkpoint, &lease).await?;
            metrics::state_transition(&self.job.job_id, JobState::Preparing.as_str());
            info!(job_id = %self.job.job_id, from = %previous.state, "Rolled back job");
            Ok(JobStatus::from_checkpoint(&checkpoint, false))
        }
        .await;
        self.release_lease(&lease).await;
        result
    }

    /// Delete the checkpoint of a finished, stopped or failed job
    pub async fn remove(&self) -> Result<JobStatus> {
        if self.is_running() {
            return Err(PipelineError::invalid_transition(&self.job.job_id, "remove", "RUNNING in this process"));
        }
        let lease = self.acquire_lease().await?;
        let result = async {
            let checkpoint = self.load().await?;
            if !checkpoint.state.is_terminal() {
                return Err(PipelineError::invalid_transition(&self.job.job_id, "remove", checkpoint.state));
            }
            self.store.delete(&self.job.job_id, &lease).await?;
            if let Some(control) = &self.control {
                control.clear().await?;
            }
            info!(job_id = %self.job.job_id, state = %checkpoint.state, "Removed job");
            Ok(JobStatus::from_checkpoint(&checkpoint, false))
        }
        .await;
        self.release_lease(&lease).await;
        result
    }

    /// Latest state, progress and last error
    pub async fn status(&self) -> Result<JobStatus> {
        let checkpoint = self.load().await?;
        let leased = self
            .store
            .current_lease(&self.job.job_id)
            .await?
            .is_some_and(|l| !l.is_expired());
        Ok(JobStatus::from_checkpoint(&checkpoint, self.is_running() || leased))
    }

    /// Poll the status until the job reaches one of `states`.
    ///
    /// A job without a checkpoint yet counts as not there; a run started
    /// concurrently may still be creating it.
    pub async fn wait_for_state(&self, states: &[JobState], timeout: Duration) -> Result<JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = match self.status().await {
                Ok(status) if states.contains(&status.state) => return Ok(status),
                Ok(status) => status.state.to_string(),
                Err(PipelineError::JobNotFound(_)) => "not created".to_string(),
                Err(e) => return Err(e),
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::Timeout(format!(
                    "job {} is {} after {} ms",
                    self.job.job_id,
                    state,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Compare every mapped table with its data nodes.
    ///
    /// Waits until the applied position of every source has reached the
    /// source position seen when the check starts; a job that is not running
    /// must already be there.
    pub async fn check_consistency(&self, mode: Option<VerifyMode>) -> Result<Vec<ConsistencyReport>> {
        let checkpoint = self.load().await?;
        let past_snapshot = |s: JobState| {
            matches!(
                s,
                JobState::IncrementalRunning | JobState::ReadyForCutover | JobState::Finished
            )
        };
        if !past_snapshot(checkpoint.state) && !checkpoint.resume_state.is_some_and(past_snapshot) {
            return Err(PipelineError::invalid_transition(
                &self.job.job_id,
                "check consistency",
                checkpoint.state,
            ));
        }

        let config = &self.settings().consistency;
        let live: BTreeMap<String, watch::Receiver<Option<Position>>> = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.applied.lock().clone())
            .unwrap_or_default();
        for datasource in self.job.source_datasources() {
            let stream = self.datasources.stream(&datasource)?;
            match live.get(&datasource) {
                Some(applied) => {
                    let mut applied = applied.clone();
                    wait_for_drain(stream.as_ref(), &mut applied, config.drain_timeout(), config.poll_interval())
                        .await?;
                }
                None => {
                    let position = checkpoint
                        .incremental_positions
                        .get(&datasource)
                        .or_else(|| checkpoint.snapshot_watermarks.get(&datasource))
                        .cloned();
                    let (_hold, mut applied) = watch::channel(position);
                    wait_for_drain(stream.as_ref(), &mut applied, Duration::ZERO, config.poll_interval()).await?;
                }
            }
        }

        let mode = mode.unwrap_or(config.mode);
        let mut reports = Vec::with_capacity(self.job.rules.len());
        for plan in self.plan_tables().await? {
            let source = self.datasources.source(&plan.source().datasource)?.clone();
            let checker = ConsistencyChecker::new(source, plan.applier, config.clone());
            reports.push(checker.verify(mode).await?);
        }
        Ok(reports)
    }
}

fn spawn_control_poller(
    control: ControlFile,
    commands: mpsc::Sender<ControlCommand>,
    interval: Duration,
    scope: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = control.next_command(interval, &scope).await {
            info!(path = %control.path().display(), %command, "Received control command");
            if commands.send(command).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmDescriptor;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::stream::MemoryChangeLog;
    use sluice_rdbc::connection::DatabaseType;
    use sluice_rdbc::types::ColumnMetadata;
    use sluice_rdbc::{FaultKind, MemoryDatabase, PgRole, Row, TableName, Value};

    struct Fixture {
        src: MemoryDatabase,
        tgt: MemoryDatabase,
        log: MemoryChangeLog,
        store: Arc<MemoryCheckpointStore>,
    }

    fn row(id: i64, v: i64) -> Row {
        Row::from_pairs([("id", Value::Int64(id)), ("v", Value::Int64(v))])
    }

    fn table(name: &str) -> TableMetadata {
        TableMetadata::new(
            TableName::new(name),
            vec![
                ColumnMetadata::new("id", "bigint").primary_key(1),
                ColumnMetadata::new("v", "bigint"),
            ],
        )
    }

    fn fixture(rows: i64) -> Fixture {
        let src = MemoryDatabase::new("src", DatabaseType::PostgreSQL);
        src.create_table(table("t"));
        src.insert_rows(&TableName::new("t"), (0..rows).map(|i| row(i, i)))
            .unwrap();
        let tgt = MemoryDatabase::new("tgt", DatabaseType::MySQL);
        tgt.create_table(table("t_0"));
        tgt.create_table(table("t_1"));
        Fixture {
            src,
            tgt,
            log: MemoryChangeLog::new("src"),
            store: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    impl Fixture {
        fn orchestrator(&self) -> JobOrchestrator {
            let rule = TableRule {
                source: SourceTable {
                    datasource: "src".into(),
                    table: TableName::new("t"),
                },
                sharding_column: "id".into(),
                algorithm: AlgorithmDescriptor::new("MOD").with_prop("sharding-count", 2),
                data_nodes: vec!["tgt.t_0".parse().unwrap(), "tgt.t_1".parse().unwrap()],
            };
            let mut settings = PipelineSettings::default();
            settings.copy.batch_size = 7;
            settings.copy.parallelism = 3;
            settings.retry = crate::retry::RetryPolicy::disabled();
            let datasources = Datasources::new()
                .with_source("src", Arc::new(self.src.clone()), Arc::new(self.log.clone()))
                .with_target("tgt", Arc::new(self.tgt.clone()));
            JobOrchestrator::new(JobDefinition::new("job-1", vec![rule]).with_settings(settings), datasources, self.store.clone())
                .with_owner("test-owner")
        }

        fn target_rows(&self) -> usize {
            self.tgt.rows(&TableName::new("t_0")).len() + self.tgt.rows(&TableName::new("t_1")).len()
        }
    }

    async fn run_until_ready(orchestrator: &Arc<JobOrchestrator>) -> JoinHandle<Result<JobStatus>> {
        let runner = orchestrator.clone();
        let task = tokio::spawn(async move { runner.start(CancellationToken::new()).await });
        orchestrator
            .wait_for_state(&[JobState::ReadyForCutover], Duration::from_secs(10))
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let f = fixture(40);
        let orchestrator = Arc::new(f.orchestrator());
        let task = run_until_ready(&orchestrator).await;
        assert_eq!(f.target_rows(), 40);

        f.log.insert(&TableName::new("t"), row(100, 1));
        f.log.update(&TableName::new("t"), row(3, 3), row(3, 33));
        f.src.insert_rows(&TableName::new("t"), [row(100, 1), row(3, 33)]).unwrap();

        let reports = orchestrator.check_consistency(None).await.unwrap();
        assert!(reports[0].is_consistent(), "{reports:?}");

        orchestrator.cutover().await.unwrap();
        let status = task.await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Finished);
        assert_eq!(status.events_applied, 2);
        assert_eq!(status.incremental_positions["src"], Position::Sequence(2));
        assert_eq!(f.log.acknowledged(), Some(Position::Sequence(2)));
        assert!(!orchestrator.is_running());

        orchestrator.remove().await.unwrap();
        assert_eq!(orchestrator.status().await.unwrap_err().class(), ErrorClass::JobNotFound);
    }

    #[tokio::test]
    async fn test_precheck_failure_is_recorded() {
        let f = fixture(5);
        f.src.update_profile(|p| p.role = Some(PgRole::default()));
        let orchestrator = f.orchestrator();
        let status = orchestrator.start(CancellationToken::new()).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.resume_state, Some(JobState::Preparing));
        let error = status.last_error.unwrap();
        assert_eq!(error.class, ErrorClass::InsufficientPrivilege);
        assert_eq!(error.code, 18051);
        assert_eq!(f.target_rows(), 0);
    }

    #[tokio::test]
    async fn test_fatal_copy_then_resume() {
        let f = fixture(30);
        f.tgt.schedule_fault(2, FaultKind::FatalAfterCommit, 1);
        let orchestrator = f.orchestrator();
        let status = orchestrator.start(CancellationToken::new()).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.last_error.unwrap().class, ErrorClass::FatalCopy);
        assert_eq!(
            orchestrator.start(CancellationToken::new()).await.unwrap_err().class(),
            ErrorClass::InvalidStateTransition
        );

        let orchestrator = Arc::new(orchestrator);
        let runner = orchestrator.clone();
        let task = tokio::spawn(async move { runner.resume(CancellationToken::new()).await });
        orchestrator
            .wait_for_state(&[JobState::ReadyForCutover], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(f.target_rows(), 30);

        orchestrator.pause().await.unwrap();
        let status = task.await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Paused);
        assert_eq!(status.resume_state, Some(JobState::IncrementalRunning));
    }

    #[tokio::test]
    async fn test_offline_pause_stop_and_rollback() {
        let f = fixture(12);
        let orchestrator = Arc::new(f.orchestrator());
        orchestrator.create().await.unwrap();
        assert_eq!(
            orchestrator.create().await.unwrap_err().class(),
            ErrorClass::JobAlreadyExists
        );
        assert_eq!(
            orchestrator.cutover().await.unwrap_err().class(),
            ErrorClass::InvalidStateTransition
        );

        let task = run_until_ready(&orchestrator).await;
        orchestrator.stop().await.unwrap();
        assert_eq!(task.await.unwrap().unwrap().state, JobState::Stopped);
        assert_eq!(f.target_rows(), 12);

        let status = orchestrator.rollback().await.unwrap();
        assert_eq!(status.state, JobState::Preparing);
        assert_eq!(status.splits_total, 0);
        assert_eq!(f.target_rows(), 0);

        let status = orchestrator.pause().await.unwrap();
        assert_eq!(status.state, JobState::Paused);
        assert_eq!(
            orchestrator.remove().await.unwrap_err().class(),
            ErrorClass::InvalidStateTransition
        );
    }

    #[tokio::test]
    async fn test_lease_excludes_second_owner() {
        let f = fixture(3);
        let first = Arc::new(f.orchestrator());
        let task = run_until_ready(&first).await;

        let second = f.orchestrator().with_owner("other-owner");
        let err = second.start(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::LeaseHeld);
        assert!(second.status().await.unwrap().running);

        first.stop().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!second.status().await.unwrap().running);
    }

    #[tokio::test]
    async fn test_unknown_algorithm_fails_before_watermark() {
        let f = fixture(3);
        let rule = TableRule {
            source: SourceTable {
                datasource: "src".into(),
                table: TableName::new("t"),
            },
            sharding_column: "id".into(),
            algorithm: AlgorithmDescriptor::new("NO_SUCH_ALGORITHM"),
            data_nodes: vec!["tgt.t_0".parse().unwrap()],
        };
        let datasources = Datasources::new()
            .with_source("src", Arc::new(f.src.clone()), Arc::new(f.log.clone()))
            .with_target("tgt", Arc::new(f.tgt.clone()));
        let orchestrator =
            JobOrchestrator::new(JobDefinition::new("job-1", vec![rule]), datasources, f.store.clone());

        let status = orchestrator.start(CancellationToken::new()).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.last_error.unwrap().class, ErrorClass::UnknownAlgorithm);
        assert!(status.snapshot_watermarks.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pauses() {
        let f = fixture(3);
        let orchestrator = Arc::new(f.orchestrator());
        let cancel = CancellationToken::new();
        let runner = orchestrator.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.start(token).await });
        orchestrator
            .wait_for_state(&[JobState::ReadyForCutover], Duration::from_secs(10))
            .await
            .unwrap();
        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap().state, JobState::Paused);
    }

    #[tokio::test]
    async fn test_wait_for_state_tolerates_missing_checkpoint() {
        let f = fixture(3);
        let orchestrator = Arc::new(f.orchestrator());
        let creator = orchestrator.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            creator.create().await
        });
        let status = orchestrator
            .wait_for_state(&[JobState::Preparing], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status.state, JobState::Preparing);
        task.await.unwrap().unwrap();

        let absent = fixture(1);
        let err = absent
            .orchestrator()
            .wait_for_state(&[JobState::Finished], Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)), "{err}");
    }

    /// Log that only retains changes once a reservation has been made
    struct ReservingLog {
        log: MemoryChangeLog,
        reserved: Arc<parking_lot::Mutex<Option<Position>>>,
    }

    #[async_trait::async_trait]
    impl ChangeStreamReader for ReservingLog {
        fn name(&self) -> &str {
            "reserving"
        }

        async fn subscribe(&self, from: Option<Position>) -> Result<crate::stream::EventStream> {
            if self.reserved.lock().is_none() {
                return Err(PipelineError::config("history was never reserved"));
            }
            self.log.subscribe(from).await
        }

        async fn prepare(&self) -> Result<Position> {
            let position = self.log.current_position().await?;
            *self.reserved.lock() = Some(position.clone());
            Ok(position)
        }

        async fn current_position(&self) -> Result<Position> {
            self.log.current_position().await
        }
    }

    #[tokio::test]
    async fn test_watermark_is_the_reserved_position() {
        let f = fixture(10);
        f.log.insert(&TableName::new("t"), row(0, 0));
        let reserved = Arc::new(parking_lot::Mutex::new(None));
        let reader = ReservingLog {
            log: f.log.clone(),
            reserved: reserved.clone(),
        };
        let job = f.orchestrator().job.clone();
        let datasources = Datasources::new()
            .with_source("src", Arc::new(f.src.clone()), Arc::new(reader))
            .with_target("tgt", Arc::new(f.tgt.clone()));
        let orchestrator = Arc::new(
            JobOrchestrator::new(job, datasources, f.store.clone()).with_owner("test-owner"),
        );

        let task = run_until_ready(&orchestrator).await;
        let status = orchestrator.status().await.unwrap();
        assert_eq!(reserved.lock().clone(), Some(Position::Sequence(1)));
        assert_eq!(status.snapshot_watermarks["src"], Position::Sequence(1));
        orchestrator.stop().await.unwrap();
        assert_eq!(task.await.unwrap().unwrap().state, JobState::Stopped);
    }
}
