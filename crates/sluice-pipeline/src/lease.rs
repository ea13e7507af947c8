//! Single-writer job lease
//!
//! A lease names the orchestrator instance allowed to write a job's
//! checkpoint. Every acquisition bumps the epoch, and checkpoint writes
//! carry the epoch they were made under so a superseded owner is fenced off.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, Result};

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_renew_interval_ms() -> u64 {
    10_000
}

/// Lease timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease lifetime without renewal
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Renewal period of a running job
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

impl LeaseConfig {
    /// Lease lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Renewal period
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

/// Ownership record of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLease {
    /// Job id
    pub job_id: String,
    /// Owner identity
    pub owner: String,
    /// Fencing epoch, incremented on every acquisition
    pub epoch: u64,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    /// Whether the lease has lapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the lease has lapsed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Next lease for `owner` after `previous`.
    ///
    /// Fails with [`PipelineError::LeaseHeld`] while another owner's lease is live.
    pub fn acquire(
        job_id: &str,
        owner: &str,
        previous: Option<&JobLease>,
        ttl: Duration,
    ) -> Result<Self> {
        let now = Utc::now();
        if let Some(prev) = previous {
            if prev.owner != owner && !prev.is_expired_at(now) {
                return Err(PipelineError::LeaseHeld {
                    job_id: job_id.to_string(),
                    owner: prev.owner.clone(),
                });
            }
        }
        Ok(Self {
            job_id: job_id.to_string(),
            owner: owner.to_string(),
            epoch: previous.map_or(1, |p| p.epoch + 1),
            expires_at: now + to_chrono(ttl),
        })
    }

    /// Extend the lease; fails if `current` is no longer this lease
    pub fn renew(&self, current: Option<&JobLease>, ttl: Duration) -> Result<Self> {
        self.verify(current)?;
        Ok(Self {
            expires_at: Utc::now() + to_chrono(ttl),
            ..self.clone()
        })
    }

    /// The record stored on release; keeps the epoch so it stays monotonic
    pub fn released(&self) -> Self {
        Self {
            expires_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Check that `current` (the stored lease) is still this live lease
    pub fn verify(&self, current: Option<&JobLease>) -> Result<()> {
        match current {
            Some(c) if c.owner == self.owner && c.epoch == self.epoch && !c.is_expired() => Ok(()),
            Some(c) if c.owner == self.owner && c.epoch == self.epoch => Err(PipelineError::checkpoint(
                format!("lease of job {} has expired", self.job_id),
            )),
            Some(c) => Err(PipelineError::LeaseHeld {
                job_id: self.job_id.clone(),
                owner: format!("{} (epoch {})", c.owner, c.epoch),
            }),
            None => Err(PipelineError::checkpoint(format!(
                "lease of job {} was released",
                self.job_id
            ))),
        }
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(36_500))
}
