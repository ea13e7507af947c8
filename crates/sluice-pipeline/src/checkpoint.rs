//! # Job checkpoints
//!
//! Durable progress of a migration job: lifecycle state, split cursors and
//! applied change stream positions.
//!
//! ## Guarantees
//!
//! - **Atomic overwrite**: the file store writes a temp file, fsyncs it and
//!   renames it over the previous record
//! - **Fencing**: every write carries the caller's [`JobLease`]; a write from
//!   a superseded owner fails with [`PipelineError::LeaseHeld`]
//! - **Versioned**: records carry `format_version`; unknown versions are
//!   rejected on load
//!
//! Positions in a checkpoint never run ahead of data durably applied to the
//! target: callers save only after the target commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ErrorReport, PipelineError, Result};
use crate::job::JobState;
use crate::lease::JobLease;
use crate::position::Position;
use crate::split::TaskSplit;

/// Current checkpoint record version
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Durable progress record of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Record version
    pub format_version: u32,
    /// Job id
    pub job_id: String,
    /// Lifecycle state
    pub state: JobState,
    /// Active state to return to on resume
    #[serde(default)]
    pub resume_state: Option<JobState>,
    /// Snapshot splits with their cursors
    #[serde(default)]
    pub splits: Vec<TaskSplit>,
    /// Source positions captured before splitting, per source datasource
    #[serde(default)]
    pub snapshot_watermarks: BTreeMap<String, Position>,
    /// Applied positions, per source datasource
    #[serde(default)]
    pub incremental_positions: BTreeMap<String, Position>,
    /// Change events applied
    #[serde(default)]
    pub events_applied: u64,
    /// Apply conflicts seen
    #[serde(default)]
    pub conflicts: u64,
    /// Last recorded error
    #[serde(default)]
    pub last_error: Option<ErrorReport>,
    /// Epoch of the lease the record was written under
    #[serde(default)]
    pub lease_epoch: u64,
    /// Job creation time
    pub created_at: DateTime<Utc>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

impl JobCheckpoint {
    /// Fresh checkpoint of a new job
    pub fn new(job_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            job_id: job_id.into(),
            state: JobState::Preparing,
            resume_state: None,
            splits: Vec::new(),
            snapshot_watermarks: BTreeMap::new(),
            incremental_positions: BTreeMap::new(),
            events_applied: 0,
            conflicts: 0,
            last_error: None,
            lease_epoch: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether every split is copied
    pub fn snapshot_complete(&self) -> bool {
        self.splits.iter().all(|s| s.completed)
    }

    /// Replace the split with the same id
    pub fn update_split(&mut self, split: &TaskSplit) -> bool {
        match self.splits.iter_mut().find(|s| s.split_id == split.split_id) {
            Some(existing) => {
                *existing = split.clone();
                true
            }
            None => false,
        }
    }

    fn check_version(&self) -> Result<()> {
        if self.format_version == CHECKPOINT_FORMAT_VERSION {
            Ok(())
        } else {
            Err(PipelineError::checkpoint(format!(
                "checkpoint of job {} has format version {}, expected {}",
                self.job_id, self.format_version, CHECKPOINT_FORMAT_VERSION
            )))
        }
    }
}

/// Persistence of checkpoints and job leases
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load a job's checkpoint
    async fn load(&self, job_id: &str) -> Result<Option<JobCheckpoint>>;

    /// Overwrite a job's checkpoint under `lease`
    async fn save(&self, checkpoint: &JobCheckpoint, lease: &JobLease) -> Result<()>;

    /// Delete a job's checkpoint under `lease`
    async fn delete(&self, job_id: &str, lease: &JobLease) -> Result<()>;

    /// Ids of all stored jobs
    async fn list(&self) -> Result<Vec<String>>;

    /// Stored lease of a job
    async fn current_lease(&self, job_id: &str) -> Result<Option<JobLease>>;

    /// Take ownership of a job
    async fn acquire_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<JobLease>;

    /// Extend a held lease
    async fn renew_lease(&self, lease: &JobLease, ttl: Duration) -> Result<JobLease>;

    /// Give up a held lease
    async fn release_lease(&self, lease: &JobLease) -> Result<()>;
}

fn validate_job_id(job_id: &str) -> Result<()> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !job_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::config(format!("invalid job id: '{job_id}'")))
    }
}

/// Checkpoints as JSON files in a directory.
///
/// Layout: `<job>.json` (checkpoint), `<job>.lease.json` (lease) and a
/// transient `<job>.lock` guarding lease changes across processes.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    fsync: bool,
    local: tokio::sync::Mutex<()>,
}

const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT: Duration = Duration::from_secs(5);

struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let started = tokio::time::Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&path)
                        .await
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.elapsed().ok())
                        .is_some_and(|age| age > LOCK_STALE_AFTER);
                    if stale {
                        warn!(path = %path.display(), "removing stale checkpoint lock");
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT {
                        return Err(PipelineError::checkpoint(format!(
                            "timed out waiting for {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store in `base_dir`
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Open a store, choosing whether writes are fsynced
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            fsync,
            local: tokio::sync::Mutex::new(()),
        })
    }

    /// Store directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn checkpoint_path(&self, job_id: &str) -> PathBuf {
        self.base_dir.join(format!("{job_id}.json"))
    }

    fn lease_path(&self, job_id: &str) -> PathBuf {
        self.base_dir.join(format!("{job_id}.lease.json"))
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        self.base_dir.join(format!("{job_id}.lock"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_lease(&self, job_id: &str) -> Result<Option<JobLease>> {
        Self::read_json(&self.lease_path(job_id)).await
    }

    async fn write_lease(&self, lease: &JobLease) -> Result<()> {
        let json = serde_json::to_vec_pretty(lease)?;
        self.write_atomic(&self.lease_path(&lease.job_id), &json).await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, job_id: &str) -> Result<Option<JobCheckpoint>> {
        validate_job_id(job_id)?;
        let checkpoint: Option<JobCheckpoint> = Self::read_json(&self.checkpoint_path(job_id)).await?;
        if let Some(cp) = &checkpoint {
            cp.check_version()?;
        }
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &JobCheckpoint, lease: &JobLease) -> Result<()> {
        validate_job_id(&checkpoint.job_id)?;
        let _local = self.local.lock().await;
        let _lock = FileLock::acquire(self.lock_path(&checkpoint.job_id)).await?;
        lease.verify(self.read_lease(&checkpoint.job_id).await?.as_ref())?;

        let mut record = checkpoint.clone();
        record.lease_epoch = lease.epoch;
        record.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&record)?;
        self.write_atomic(&self.checkpoint_path(&checkpoint.job_id), &json)
            .await?;
        debug!(job_id = %checkpoint.job_id, state = %checkpoint.state, "saved checkpoint");
        Ok(())
    }

    async fn delete(&self, job_id: &str, lease: &JobLease) -> Result<()> {
        validate_job_id(job_id)?;
        let _local = self.local.lock().await;
        let _lock = FileLock::acquire(self.lock_path(job_id)).await?;
        lease.verify(self.read_lease(job_id).await?.as_ref())?;
        match fs::remove_file(self.checkpoint_path(job_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(job_id, "deleted checkpoint");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                if !id.ends_with(".lease") {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn current_lease(&self, job_id: &str) -> Result<Option<JobLease>> {
        validate_job_id(job_id)?;
        self.read_lease(job_id).await
    }

    async fn acquire_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<JobLease> {
        validate_job_id(job_id)?;
        let _local = self.local.lock().await;
        let _lock = FileLock::acquire(self.lock_path(job_id)).await?;
        let previous = self.read_lease(job_id).await?;
        let lease = JobLease::acquire(job_id, owner, previous.as_ref(), ttl)?;
        self.write_lease(&lease).await?;
        info!(job_id, owner, epoch = lease.epoch, "acquired job lease");
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &JobLease, ttl: Duration) -> Result<JobLease> {
        let _local = self.local.lock().await;
        let _lock = FileLock::acquire(self.lock_path(&lease.job_id)).await?;
        let renewed = lease.renew(self.read_lease(&lease.job_id).await?.as_ref(), ttl)?;
        self.write_lease(&renewed).await?;
        Ok(renewed)
    }

    async fn release_lease(&self, lease: &JobLease) -> Result<()> {
        let _local = self.local.lock().await;
        let _lock = FileLock::acquire(self.lock_path(&lease.job_id)).await?;
        let current = self.read_lease(&lease.job_id).await?;
        if lease.verify(current.as_ref()).is_ok() {
            self.write_lease(&lease.released()).await?;
            info!(job_id = %lease.job_id, owner = %lease.owner, "released job lease");
        }
        Ok(())
    }
}

/// In-memory checkpoint store (for testing or single-process embedding)
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, JobCheckpoint>>,
    leases: Mutex<HashMap<String, JobLease>>,
    saves: AtomicU64,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, job_id: &str) -> Result<Option<JobCheckpoint>> {
        Ok(self.checkpoints.lock().get(job_id).cloned())
    }

    async fn save(&self, checkpoint: &JobCheckpoint, lease: &JobLease) -> Result<()> {
        let leases = self.leases.lock();
        lease.verify(leases.get(&checkpoint.job_id))?;
        let mut record = checkpoint.clone();
        record.lease_epoch = lease.epoch;
        record.updated_at = Utc::now();
        self.checkpoints
            .lock()
            .insert(checkpoint.job_id.clone(), record);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, job_id: &str, lease: &JobLease) -> Result<()> {
        let leases = self.leases.lock();
        lease.verify(leases.get(job_id))?;
        self.checkpoints.lock().remove(job_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self.checkpoints.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn current_lease(&self, job_id: &str) -> Result<Option<JobLease>> {
        Ok(self.leases.lock().get(job_id).cloned())
    }

    async fn acquire_lease(&self, job_id: &str, owner: &str, ttl: Duration) -> Result<JobLease> {
        let mut leases = self.leases.lock();
        let lease = JobLease::acquire(job_id, owner, leases.get(job_id), ttl)?;
        leases.insert(job_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &JobLease, ttl: Duration) -> Result<JobLease> {
        let mut leases = self.leases.lock();
        let renewed = lease.renew(leases.get(&lease.job_id), ttl)?;
        leases.insert(lease.job_id.clone(), renewed.clone());
        Ok(renewed)
    }

    async fn release_lease(&self, lease: &JobLease) -> Result<()> {
        let mut leases = self.leases.lock();
        if lease.verify(leases.get(&lease.job_id)).is_ok() {
            leases.insert(lease.job_id.clone(), lease.released());
        }
        Ok(())
    }
}
