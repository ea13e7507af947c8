//! Pipeline metrics
//!
//! Recorded through the `metrics` facade; installing an exporter is up to
//! the embedding process. Every series carries a `job_id` label.

use metrics::{counter, gauge, histogram};

/// Rows written by the snapshot copier
pub const ROWS_COPIED: &str = "sluice_rows_copied_total";
/// Change events applied to the target
pub const EVENTS_APPLIED: &str = "sluice_events_applied_total";
/// Changes that matched zero or several target rows
pub const APPLY_CONFLICTS: &str = "sluice_apply_conflicts_total";
/// Job state transitions
pub const STATE_TRANSITIONS: &str = "sluice_job_state_transitions_total";
/// Retried operations
pub const RETRIES: &str = "sluice_retries_total";
/// Duration of one apply batch
pub const APPLY_BATCH_MS: &str = "sluice_apply_batch_duration_ms";
/// Events dispatched but not yet applied
pub const IN_FLIGHT_EVENTS: &str = "sluice_in_flight_events";

pub(crate) fn rows_copied(job_id: &str, rows: u64) {
    counter!(ROWS_COPIED, "job_id" => job_id.to_string()).increment(rows);
}

pub(crate) fn events_applied(job_id: &str, events: u64) {
    counter!(EVENTS_APPLIED, "job_id" => job_id.to_string()).increment(events);
}

pub(crate) fn apply_conflict(job_id: &str) {
    counter!(APPLY_CONFLICTS, "job_id" => job_id.to_string()).increment(1);
}

pub(crate) fn state_transition(job_id: &str, to: &str) {
    counter!(STATE_TRANSITIONS, "job_id" => job_id.to_string(), "state" => to.to_string())
        .increment(1);
}

pub(crate) fn retry(job_id: &str, stage: &'static str) {
    counter!(RETRIES, "job_id" => job_id.to_string(), "stage" => stage).increment(1);
}

pub(crate) fn apply_batch(job_id: &str, millis: f64) {
    histogram!(APPLY_BATCH_MS, "job_id" => job_id.to_string()).record(millis);
}

pub(crate) fn in_flight(job_id: &str, pending: usize) {
    gauge!(IN_FLIGHT_EVENTS, "job_id" => job_id.to_string()).set(pending as f64);
}
