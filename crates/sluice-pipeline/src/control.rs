//! Operator commands delivered through the state directory
//!
//! A running orchestrator polls `<dir>/<job_id>.control`. Another process
//! writes a command there (atomically, via rename) and the orchestrator
//! takes it, deleting the file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Command for a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Halt, keeping the resume point
    Pause,
    /// Halt for good
    Stop,
    /// Finish the job once it is ready for cutover
    Cutover,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Cutover => "cutover",
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlRecord {
    command: ControlCommand,
    requested_at: chrono::DateTime<chrono::Utc>,
}

/// Control file of one job
#[derive(Debug, Clone)]
pub struct ControlFile {
    path: PathBuf,
}

impl ControlFile {
    /// Control file of `job_id` under `dir`
    pub fn new(dir: impl AsRef<Path>, job_id: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{job_id}.control")),
        }
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave `command` for the running orchestrator
    pub async fn send(&self, command: ControlCommand) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let record = ControlRecord {
            command,
            requested_at: chrono::Utc::now(),
        };
        let tmp = self.path.with_extension("control.tmp");
        fs::write(&tmp, serde_json::to_vec(&record)?).await?;
        fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), %command, "Wrote control command");
        Ok(())
    }

    /// Remove and return a pending command
    pub async fn take(&self) -> Result<Option<ControlCommand>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let record: ControlRecord = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::config(format!("malformed control file {}: {e}", self.path.display())))?;
        debug!(command = %record.command, requested_at = %record.requested_at, "Took control command");
        Ok(Some(record.command))
    }

    /// Drop a stale command
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the next command; `None` once `cancel` fires
    pub async fn next_command(&self, interval: Duration, cancel: &CancellationToken) -> Option<ControlCommand> {
        loop {
            match self.take().await {
                Ok(Some(command)) => return Some(command),
                Ok(None) => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "Ignoring control file"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
