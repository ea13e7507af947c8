//! End-to-end migration tests against in-memory datasources
//!
//! Run with: cargo test -p sluice-pipeline --test migration -- --nocapture

mod common;

use anyhow::Result;
use common::*;
use sluice_pipeline::checkpoint::CheckpointStore;
use sluice_pipeline::consistency::{MismatchKind, MismatchedKey};
use sluice_pipeline::{ErrorClass, JobState, Position, VerifyMode};
use sluice_rdbc::store::WriteOp;
use sluice_rdbc::{FaultKind, PgRole, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

// =============================================================================
// SNAPSHOT COPY
// =============================================================================

/// Two failures during the copy; every row lands exactly once
#[tokio::test]
async fn test_snapshot_survives_two_restarts() -> Result<()> {
    let cluster = Cluster::new(1000).await;
    cluster.target.schedule_fault(5, FaultKind::FatalAfterCommit, 1);
    cluster.target.schedule_fault(15, FaultKind::Fatal, 1);
    let orchestrator = cluster.orchestrator("node-1");

    let status = orchestrator.start(CancellationToken::new()).await?;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.resume_state, Some(JobState::Copying));
    assert_eq!(status.splits_total, 4);
    assert_eq!(status.last_error.as_ref().map(|e| e.class), Some(ErrorClass::FatalCopy));
    info!("first failure after {} rows", status.rows_copied);

    let status = orchestrator.resume(CancellationToken::new()).await?;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.resume_state, Some(JobState::Copying));

    let task = spawn_resume(&orchestrator);
    let status = wait_ready(&orchestrator).await;
    assert_eq!(status.splits_completed, 4);
    assert_eq!(status.rows_copied, 1000);

    let rows = cluster.target_orders();
    assert_eq!(rows.len(), 1000);
    let ids: BTreeSet<i64> = rows
        .iter()
        .filter_map(|r| r.get_by_name("order_id").and_then(Value::as_i64))
        .collect();
    assert_eq!(ids, (0..1000).collect());
    for n in 0..SHARDS {
        assert_eq!(cluster.target.rows(&shard(n)).len(), 250);
    }

    let reports = orchestrator.check_consistency(Some(VerifyMode::Digest)).await?;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_consistent(), "{:?}", reports[0]);
    assert_eq!(reports[0].source_count, 1000);

    orchestrator.cutover().await?;
    assert_eq!(task.await??.state, JobState::Finished);
    Ok(())
}

/// A process dies mid-run; the same owner picks the job up without waiting
/// for its lease to expire, another owner is turned away
#[tokio::test]
async fn test_restart_after_crash() -> Result<()> {
    let cluster = Cluster::new(1000).await;
    let first = cluster.orchestrator("node-1");
    let task = spawn_start(&first);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = first.status().await;
        let copying = |s: &sluice_pipeline::JobStatus| {
            s.rows_copied > 0 || !matches!(s.state, JobState::Preparing | JobState::Splitting)
        };
        if status.is_ok_and(|s| copying(&s)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "copy never started");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    task.abort();
    let _ = task.await;
    assert!(!first.is_running());

    let other = cluster.orchestrator("node-2");
    let err = other.start(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::LeaseHeld);

    let restarted = cluster.orchestrator("node-1");
    let task = spawn_start(&restarted);
    wait_running(&restarted).await;
    wait_ready(&restarted).await;
    assert_eq!(cluster.target_orders().len(), 1000);
    let reports = restarted.check_consistency(None).await?;
    assert!(reports[0].is_consistent(), "{:?}", reports[0]);

    restarted.stop().await?;
    assert_eq!(task.await??.state, JobState::Stopped);
    Ok(())
}

// =============================================================================
// INCREMENTAL SYNC
// =============================================================================

/// Changes after the watermark reach the right shards, including a key move
#[tokio::test]
async fn test_changes_follow_the_snapshot() -> Result<()> {
    let cluster = Cluster::new(100).await;
    let orchestrator = cluster.orchestrator("node-1");
    let task = spawn_start(&orchestrator);
    wait_ready(&orchestrator).await;

    cluster.insert(500, 1);
    cluster.update(order(5, 50), order(5, 55));
    cluster.delete(order(7, 70));
    cluster.update(order(9, 90), order(1002, 90));

    let reports = orchestrator.check_consistency(None).await?;
    assert!(reports[0].is_consistent(), "{:?}", reports[0]);

    assert!(cluster.target_row(500).is_some());
    assert_eq!(
        cluster.target_row(5).and_then(|r| r.get_by_name("amount").cloned()),
        Some(Value::Int64(55))
    );
    assert!(cluster.target_row(7).is_none());
    assert!(cluster.target_row(9).is_none());
    assert!(cluster.target_row(1002).is_some());

    orchestrator.cutover().await?;
    let status = task.await??;
    assert_eq!(status.state, JobState::Finished);
    assert_eq!(status.events_applied, 4);
    assert_eq!(status.incremental_positions["src"], Position::Sequence(4));
    assert_eq!(cluster.log.acknowledged(), Some(Position::Sequence(4)));
    Ok(())
}

/// Replaying the whole change log from the start leaves the target unchanged
#[tokio::test]
async fn test_replayed_changes_converge() -> Result<()> {
    let cluster = Cluster::new(200).await;
    let orchestrator = cluster.orchestrator("node-1");
    let task = spawn_start(&orchestrator);
    wait_ready(&orchestrator).await;

    for id in 1000..1010 {
        cluster.insert(id, id);
    }
    cluster.update(order(5, 50), order(5, 51));
    cluster.update(order(1003, 1003), order(1003, 0));
    cluster.delete(order(7, 70));
    cluster.delete(order(1004, 1004));
    cluster.update(order(11, 110), order(2011, 110));
    assert!(orchestrator.check_consistency(None).await?[0].is_consistent());
    let before = cluster.target_orders();

    orchestrator.pause().await?;
    assert_eq!(task.await??.state, JobState::Paused);

    // Rewind the applied position to the start of the log
    let lease = cluster
        .store
        .acquire_lease(JOB_ID, "operator", Duration::from_secs(5))
        .await?;
    let mut checkpoint = cluster.store.load(JOB_ID).await?.unwrap();
    checkpoint.incremental_positions.insert("src".into(), Position::Sequence(0));
    cluster.store.save(&checkpoint, &lease).await?;
    cluster.store.release_lease(&lease).await?;

    let task = spawn_resume(&orchestrator);
    let status = wait_ready(&orchestrator).await;
    assert_eq!(status.incremental_positions["src"], Position::Sequence(15));
    assert_eq!(cluster.target_orders(), before);
    assert!(orchestrator.check_consistency(None).await?[0].is_consistent());

    orchestrator.stop().await?;
    task.await??;
    Ok(())
}

/// Hundreds of updates to one key, interleaved with other keys, apply in order
#[tokio::test]
async fn test_changes_to_one_key_apply_in_order() -> Result<()> {
    let cluster = Cluster::new(64).await;
    let orchestrator = cluster.orchestrator("node-1");
    let task = spawn_start(&orchestrator);
    wait_ready(&orchestrator).await;

    let mut amounts: Vec<i64> = (0..64).map(|id| id * 10).collect();
    for step in 1..=300i64 {
        cluster.update(order(42, amounts[42]), order(42, step));
        amounts[42] = step;
        let other = (step * 7) % 64;
        if other != 42 {
            cluster.update(order(other, amounts[other as usize]), order(other, -step));
            amounts[other as usize] = -step;
        }
    }

    let reports = orchestrator.check_consistency(None).await?;
    assert!(reports[0].is_consistent(), "{:?}", reports[0]);
    assert_eq!(
        cluster.target_row(42).and_then(|r| r.get_by_name("amount").cloned()),
        Some(Value::Int64(300))
    );
    let status = orchestrator.status().await?;
    assert_eq!(status.conflicts, 0);

    orchestrator.cutover().await?;
    assert_eq!(task.await??.state, JobState::Finished);
    Ok(())
}

// =============================================================================
// PRE-FLIGHT CHECKS
// =============================================================================

/// A source user without replication rights stops the job before any copy
#[tokio::test]
async fn test_missing_replication_privilege_blocks_start() -> Result<()> {
    let cluster = Cluster::new(50).await;
    cluster.source.update_profile(|p| p.role = Some(PgRole::default()));
    let orchestrator = cluster.orchestrator("node-1");

    let err = orchestrator.precheck().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InsufficientPrivilege);

    let status = orchestrator.start(CancellationToken::new()).await?;
    assert_eq!(status.state, JobState::Failed);
    let error = status.last_error.unwrap();
    assert_eq!(error.class, ErrorClass::InsufficientPrivilege);
    assert_eq!(error.sql_state, "42501");
    assert!(cluster.target_orders().is_empty());

    cluster.source.update_profile(|p| {
        p.role = Some(PgRole {
            rolreplication: true,
            ..PgRole::default()
        })
    });
    let task = spawn_resume(&orchestrator);
    let status = wait_ready(&orchestrator).await;
    assert_eq!(status.rows_copied, 50);
    assert_eq!(status.last_error.map(|e| e.class), Some(ErrorClass::InsufficientPrivilege));

    orchestrator.stop().await?;
    task.await??;
    Ok(())
}

/// Leftover rows on a data node fail the target check
#[tokio::test]
async fn test_non_empty_target_blocks_start() -> Result<()> {
    let cluster = Cluster::new(10).await;
    cluster.target.insert_rows(&shard(3), [order(3, 0)])?;
    let orchestrator = cluster.orchestrator("node-1");

    let status = orchestrator.start(CancellationToken::new()).await?;
    assert_eq!(status.state, JobState::Failed);
    let error = status.last_error.unwrap();
    assert_eq!(error.class, ErrorClass::PrecheckFailed);
    assert!(error.message.contains("tgt.t_order_3"), "{}", error.message);
    Ok(())
}

// =============================================================================
// CONSISTENCY
// =============================================================================

/// One diverged target row is reported by key
#[tokio::test]
async fn test_consistency_names_the_diverged_key() -> Result<()> {
    let cluster = Cluster::new(100).await;
    let orchestrator = cluster.orchestrator("node-1");
    let task = spawn_start(&orchestrator);
    wait_ready(&orchestrator).await;

    cluster.target.apply(
        &shard(17 % SHARDS),
        &WriteOp::Upsert {
            row: order(17, 999),
            key_columns: vec!["order_id".into()],
        },
    )?;

    let report = orchestrator.check_consistency(Some(VerifyMode::Digest)).await?.remove(0);
    assert!(!report.is_consistent());
    assert!(report.count_matched);
    assert_eq!(report.digest_matched, Some(false));
    assert_eq!(
        report.mismatched_keys,
        vec![MismatchedKey {
            key: "order_id=17".into(),
            kind: MismatchKind::ContentDiffers,
        }]
    );

    let report = orchestrator.check_consistency(Some(VerifyMode::Count)).await?.remove(0);
    assert!(report.is_consistent());
    assert_eq!(report.digest_matched, None);

    orchestrator.stop().await?;
    task.await??;
    Ok(())
}

// =============================================================================
// OPERATOR CONTROL
// =============================================================================

/// A second process pauses the running job through the control file
#[tokio::test]
async fn test_pause_from_another_process() -> Result<()> {
    let cluster = Cluster::new(20).await;
    let runner = cluster.orchestrator("node-1");
    let task = spawn_start(&runner);
    wait_ready(&runner).await;

    let operator = cluster.orchestrator("operator");
    let status = operator.pause().await?;
    assert!(status.running);

    let status = task.await??;
    assert_eq!(status.state, JobState::Paused);
    assert_eq!(status.resume_state, Some(JobState::IncrementalRunning));

    let task = spawn_resume(&operator);
    wait_ready(&operator).await;
    operator.cutover().await?;
    assert_eq!(task.await??.state, JobState::Finished);

    operator.remove().await?;
    assert_eq!(operator.status().await.unwrap_err().class(), ErrorClass::JobNotFound);
    assert!(!cluster.state_dir.path().join(format!("{JOB_ID}.control")).exists());
    Ok(())
}

/// Rollback empties every data node and the job starts over
#[tokio::test]
async fn test_rollback_starts_over() -> Result<()> {
    let cluster = Cluster::new(40).await;
    let orchestrator = cluster.orchestrator("node-1");
    let task = spawn_start(&orchestrator);
    wait_ready(&orchestrator).await;
    assert_eq!(cluster.target_orders().len(), 40);

    let status = orchestrator.rollback().await?;
    assert_eq!(status.state, JobState::Preparing);
    assert_eq!(task.await??.state, JobState::Stopped);
    assert!(cluster.target_orders().is_empty());

    let task = spawn_start(&orchestrator);
    wait_ready(&orchestrator).await;
    assert_eq!(cluster.target_orders().len(), 40);
    orchestrator.cutover().await?;
    task.await??;
    Ok(())
}
