//! Job lifecycle states and status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::checkpoint::JobCheckpoint;
use crate::error::ErrorReport;
use crate::position::Position;

/// Lifecycle state of a migration job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Pre-flight verification
    Preparing,
    /// Cutting tables into splits
    Splitting,
    /// Snapshot copy
    Copying,
    /// Applying the change stream
    IncrementalRunning,
    /// Caught up with the source; waiting for cutover
    ReadyForCutover,
    /// Cut over
    Finished,
    /// Paused by the operator
    Paused,
    /// Stopped by the operator
    Stopped,
    /// Stopped by an error
    Failed,
}

impl JobState {
    /// Whether the state is a step of the migration itself
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Preparing
                | Self::Splitting
                | Self::Copying
                | Self::IncrementalRunning
                | Self::ReadyForCutover
        )
    }

    /// Whether `resume` may continue the job from this state
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Stopped | Self::Failed)
    }

    /// Whether the job may be removed in this state
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Failed)
    }

    /// Whether the lifecycle allows moving to `next`
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (_, Failed) => true,
            (_, Preparing) => true,
            (Preparing, Splitting)
            | (Splitting, Copying)
            | (Copying, IncrementalRunning)
            | (IncrementalRunning, ReadyForCutover)
            | (ReadyForCutover, Finished) => true,
            (from, Paused | Stopped) => from.is_active() || (from == Paused && next == Stopped),
            (from, to) if from.is_resumable() => to.is_active(),
            _ => false,
        }
    }

    /// Upper-case name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Splitting => "SPLITTING",
            Self::Copying => "COPYING",
            Self::IncrementalRunning => "INCREMENTAL_RUNNING",
            Self::ReadyForCutover => "READY_FOR_CUTOVER",
            Self::Finished => "FINISHED",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job id
    pub job_id: String,
    /// Current state
    pub state: JobState,
    /// State `resume` returns to
    pub resume_state: Option<JobState>,
    /// Whether an orchestrator is driving the job right now
    pub running: bool,
    /// Number of splits
    pub splits_total: usize,
    /// Completed splits
    pub splits_completed: usize,
    /// Rows written by the snapshot copy
    pub rows_copied: u64,
    /// Source positions captured before the snapshot
    pub snapshot_watermarks: BTreeMap<String, Position>,
    /// Applied change stream positions per source datasource
    pub incremental_positions: BTreeMap<String, Position>,
    /// Change events applied
    pub events_applied: u64,
    /// Apply conflicts seen
    pub conflicts: u64,
    /// Last recorded error
    pub last_error: Option<ErrorReport>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last checkpoint time
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    /// Status view of a checkpoint
    pub fn from_checkpoint(checkpoint: &JobCheckpoint, running: bool) -> Self {
        Self {
            job_id: checkpoint.job_id.clone(),
            state: checkpoint.state,
            resume_state: checkpoint.resume_state,
            running,
            splits_total: checkpoint.splits.len(),
            splits_completed: checkpoint.splits.iter().filter(|s| s.completed).count(),
            rows_copied: checkpoint.splits.iter().map(|s| s.rows_copied).sum(),
            snapshot_watermarks: checkpoint.snapshot_watermarks.clone(),
            incremental_positions: checkpoint.incremental_positions.clone(),
            events_applied: checkpoint.events_applied,
            conflicts: checkpoint.conflicts,
            last_error: checkpoint.last_error.clone(),
            created_at: checkpoint.created_at,
            updated_at: checkpoint.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        use JobState::*;
        let path = [
            Preparing,
            Splitting,
            Copying,
            IncrementalRunning,
            ReadyForCutover,
            Finished,
        ];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{} -> {}", w[0], w[1]);
        }
        assert!(!Preparing.can_transition_to(Copying));
        assert!(!Finished.can_transition_to(Paused));
    }

    #[test]
    fn test_pause_resume_and_failure() {
        use JobState::*;
        assert!(Copying.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Copying));
        assert!(Failed.can_transition_to(IncrementalRunning));
        assert!(Paused.can_transition_to(Stopped));
        assert!(Finished.can_transition_to(Failed));
        assert!(!Paused.can_transition_to(Finished));
        assert!(Finished.is_terminal() && Stopped.is_terminal() && !Paused.is_terminal());
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&JobState::ReadyForCutover).unwrap();
        assert_eq!(json, "\"READY_FOR_CUTOVER\"");
        assert_eq!(JobState::IncrementalRunning.to_string(), "INCREMENTAL_RUNNING");
    }
}
