//! # sluice-pipeline - Online sharding migration
//!
//! Moves tables from source databases into a sharded set of target tables
//! while the source keeps taking writes.
//!
//! ## Architecture
//!
//! ```text
//!  source tables ──split──▶ SnapshotCopier ─┐
//!                                           ├──▶ TableApplier ──route──▶ data nodes
//!  change stream ──▶ IncrementalEngine ─────┘
//!                          │
//!                          ▼
//!                 JobOrchestrator ──▶ CheckpointStore (+ lease)
//! ```
//!
//! - [`JobOrchestrator`] drives a job through its [`JobState`]s and is the
//!   only writer of its [`JobCheckpoint`]
//! - [`SnapshotCopier`] copies key-range splits in batches, resuming from
//!   the last recorded cursor
//! - [`IncrementalEngine`] applies a [`ChangeStreamReader`] in per-key order
//!   from the snapshot watermark
//! - [`ConsistencyChecker`] compares row counts and digests per table
//! - [`CompatibilityChecker`] runs the pre-flight checks per dialect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> sluice_pipeline::Result<()> {
//! use sluice_pipeline::{Datasources, FileCheckpointStore, JobConfig, JobDefinition, JobOrchestrator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = JobConfig::from_file("job.yaml")?;
//! let store = FileCheckpointStore::new(&config.pipeline.state.dir).await?;
//! # let datasources = Datasources::new();
//! let orchestrator = JobOrchestrator::new(JobDefinition::from_config(&config)?, datasources, Arc::new(store));
//! let status = orchestrator.start(CancellationToken::new()).await?;
//! println!("{} is {}", status.job_id, status.state);
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod checkpoint;
pub mod config;
pub mod consistency;
pub mod control;
pub mod copier;
pub mod error;
pub mod event;
pub mod incremental;
pub mod job;
pub mod lease;
mod metrics;
pub mod orchestrator;
pub mod position;
pub mod precheck;
pub mod retry;
pub mod routing;
pub mod split;
pub mod stream;

pub use algorithm::{AlgorithmDescriptor, AlgorithmRegistry, ShardingAlgorithm};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, JobCheckpoint, MemoryCheckpointStore};
pub use config::{JobConfig, PipelineSettings};
pub use consistency::{ConsistencyChecker, ConsistencyConfig, ConsistencyReport, VerifyMode};
pub use control::{ControlCommand, ControlFile};
pub use copier::SnapshotCopier;
pub use error::{ErrorClass, ErrorReport, PipelineError, Result};
pub use event::{ChangeEvent, ChangeOp};
pub use incremental::{IncrementalConfig, IncrementalEngine, TableApplier};
pub use job::{JobState, JobStatus};
pub use lease::{JobLease, LeaseConfig};
pub use orchestrator::{Datasources, JobDefinition, JobOrchestrator};
pub use position::Position;
pub use precheck::CompatibilityChecker;
pub use retry::RetryPolicy;
pub use routing::{DataNode, SourceTable, TableRouter, TableRule};
pub use split::TaskSplit;
pub use stream::{ChangeStreamReader, MemoryChangeLog};
