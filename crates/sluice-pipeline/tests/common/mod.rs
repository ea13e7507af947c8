//! Shared fixtures for migration tests
//!
//! One PostgreSQL-flavoured source with `t_order(order_id, user_id, amount)`
//! and a MySQL-flavoured target holding `t_order_0..3`, routed by
//! `order_id % 4`. Checkpoints live in a temporary state directory.

#![allow(dead_code)]

use sluice_pipeline::config::PipelineSettings;
use sluice_pipeline::{
    AlgorithmDescriptor, ControlFile, Datasources, FileCheckpointStore, JobDefinition,
    JobOrchestrator, JobState, JobStatus, MemoryChangeLog, RetryPolicy, SourceTable, TableRule,
};
use sluice_rdbc::connection::DatabaseType;
use sluice_rdbc::store::WriteOp;
use sluice_rdbc::types::{ColumnMetadata, TableMetadata};
use sluice_rdbc::{MemoryDatabase, Row, TableName, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const JOB_ID: &str = "order-migration";
pub const SHARDS: i64 = 4;
pub const WAIT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn order(id: i64, amount: i64) -> Row {
    Row::from_pairs([
        ("order_id", Value::Int64(id)),
        ("user_id", Value::Int64(id % 13)),
        ("amount", Value::Int64(amount)),
    ])
}

pub fn order_key(id: i64) -> Row {
    Row::from_pairs([("order_id", Value::Int64(id))])
}

fn orders_table(name: &str) -> TableMetadata {
    TableMetadata::new(
        TableName::new(name),
        vec![
            ColumnMetadata::new("order_id", "bigint").primary_key(1),
            ColumnMetadata::new("user_id", "bigint"),
            ColumnMetadata::new("amount", "bigint"),
        ],
    )
}

pub fn shard(n: i64) -> TableName {
    TableName::new(format!("t_order_{n}"))
}

pub struct Cluster {
    pub source: MemoryDatabase,
    pub target: MemoryDatabase,
    pub log: MemoryChangeLog,
    pub store: Arc<FileCheckpointStore>,
    pub state_dir: TempDir,
}

impl Cluster {
    /// Source with orders `0..rows`, empty target shards
    pub async fn new(rows: i64) -> Self {
        init_tracing();
        let source = MemoryDatabase::new("src", DatabaseType::PostgreSQL);
        source.create_table(orders_table("t_order"));
        source
            .insert_rows(&TableName::new("t_order"), (0..rows).map(|id| order(id, id * 10)))
            .unwrap();

        let target = MemoryDatabase::new("tgt", DatabaseType::MySQL);
        for n in 0..SHARDS {
            target.create_table(orders_table(&format!("t_order_{n}")));
        }

        let state_dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(state_dir.path()).await.unwrap());
        Self {
            source,
            target,
            log: MemoryChangeLog::new("src-wal"),
            store,
            state_dir,
        }
    }

    pub fn rule(&self) -> TableRule {
        TableRule {
            source: SourceTable {
                datasource: "src".into(),
                table: TableName::new("t_order"),
            },
            sharding_column: "order_id".into(),
            algorithm: AlgorithmDescriptor::new("MOD").with_prop("sharding-count", SHARDS),
            data_nodes: (0..SHARDS)
                .map(|n| format!("tgt.t_order_{n}").parse().unwrap())
                .collect(),
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.copy.batch_size = 25;
        settings.copy.parallelism = 4;
        settings.copy.concurrency = 2;
        settings.retry = RetryPolicy::disabled();
        settings.consistency.poll_interval_ms = 10;
        settings.consistency.drain_timeout_ms = 10_000;
        settings.state.dir = self.state_dir.path().to_path_buf();
        settings.state.control_poll_ms = 10;
        settings
    }

    pub fn datasources(&self) -> Datasources {
        Datasources::new()
            .with_source("src", Arc::new(self.source.clone()), Arc::new(self.log.clone()))
            .with_target("tgt", Arc::new(self.target.clone()))
    }

    pub fn orchestrator(&self, owner: &str) -> Arc<JobOrchestrator> {
        self.orchestrator_with(owner, self.settings())
    }

    pub fn orchestrator_with(&self, owner: &str, settings: PipelineSettings) -> Arc<JobOrchestrator> {
        let job = JobDefinition::new(JOB_ID, vec![self.rule()]).with_settings(settings);
        Arc::new(
            JobOrchestrator::new(job, self.datasources(), self.store.clone())
                .with_owner(owner)
                .with_control_file(ControlFile::new(self.state_dir.path(), JOB_ID)),
        )
    }

    /// Rows across every target shard, by order id
    pub fn target_orders(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = (0..SHARDS).flat_map(|n| self.target.rows(&shard(n))).collect();
        rows.sort_by_key(|r| r.get_by_name("order_id").and_then(Value::as_i64));
        rows
    }

    pub fn target_row(&self, id: i64) -> Option<Row> {
        self.target
            .rows(&shard(id % SHARDS))
            .into_iter()
            .find(|r| r.get_by_name("order_id").and_then(Value::as_i64) == Some(id))
    }

    /// Insert on the source and record the change
    pub fn insert(&self, id: i64, amount: i64) {
        let row = order(id, amount);
        self.source
            .insert_rows(&TableName::new("t_order"), [row.clone()])
            .unwrap();
        self.log.insert(&TableName::new("t_order"), row);
    }

    /// Update an order on the source and record the change
    pub fn update(&self, before: Row, after: Row) {
        let table = TableName::new("t_order");
        let key = before.select(&["order_id".to_string()]).unwrap();
        self.source
            .apply(&table, &WriteOp::DeleteMatching { filter: key })
            .unwrap();
        self.source.insert_rows(&table, [after.clone()]).unwrap();
        self.log.update(&table, before, after);
    }

    /// Delete an order on the source and record the change
    pub fn delete(&self, before: Row) {
        let table = TableName::new("t_order");
        let key = before.select(&["order_id".to_string()]).unwrap();
        self.source
            .apply(&table, &WriteOp::DeleteMatching { filter: key })
            .unwrap();
        self.log.delete(&table, before);
    }
}

/// Start `orchestrator` in the background
pub fn spawn_start(orchestrator: &Arc<JobOrchestrator>) -> JoinHandle<sluice_pipeline::Result<JobStatus>> {
    let runner = orchestrator.clone();
    tokio::spawn(async move { runner.start(CancellationToken::new()).await })
}

/// Resume `orchestrator` in the background
pub fn spawn_resume(orchestrator: &Arc<JobOrchestrator>) -> JoinHandle<sluice_pipeline::Result<JobStatus>> {
    let runner = orchestrator.clone();
    tokio::spawn(async move { runner.resume(CancellationToken::new()).await })
}

pub async fn wait_ready(orchestrator: &JobOrchestrator) -> JobStatus {
    orchestrator
        .wait_for_state(&[JobState::ReadyForCutover], WAIT)
        .await
        .unwrap()
}

/// Wait until `orchestrator` has entered its run
pub async fn wait_running(orchestrator: &JobOrchestrator) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !orchestrator.is_running() {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
