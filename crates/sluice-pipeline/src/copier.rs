//! Snapshot copy of one split
//!
//! Each batch is read after the split cursor, routed to its data nodes,
//! written there, and only then reported to the [`ProgressSink`]. A crash
//! between the write and the report replays the batch, which the write
//! semantics make harmless: keyed rows are upserted and keyless rows are
//! inserted only when no identical row exists.

use async_trait::async_trait;
use sluice_rdbc::store::{ScanRequest, TableStore, WriteOp};
use sluice_rdbc::Row;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::incremental::TableApplier;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::split::{SplitCursor, SplitRange, TaskSplit};

fn default_batch_size() -> usize {
    1000
}

/// Receives split progress after every committed batch
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persist the split's cursor and counters
    async fn record(&self, split: &TaskSplit) -> Result<()>;
}

/// Outcome of one [`SnapshotCopier::copy`] call
#[derive(Debug, Clone, PartialEq)]
pub struct CopyResult {
    /// The split as last recorded
    pub split: TaskSplit,
    /// Rows written by this call
    pub rows_copied: u64,
    /// Batches written by this call
    pub batches: u64,
    /// Whether the split is fully copied
    pub completed: bool,
    /// Wall time of this call
    pub elapsed: Duration,
}

/// Copies splits of one source table to its data nodes
pub struct SnapshotCopier {
    job_id: String,
    source: Arc<dyn TableStore>,
    target: TableApplier,
    batch_size: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SnapshotCopier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCopier")
            .field("job_id", &self.job_id)
            .field("source", &self.source.name())
            .field("target", &self.target)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl SnapshotCopier {
    /// Copier reading from `source` and writing through `target`
    pub fn new(
        job_id: impl Into<String>,
        source: Arc<dyn TableStore>,
        target: TableApplier,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source,
            target,
            batch_size: default_batch_size(),
            retry,
        }
    }

    /// Rows per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn fatal(&self, split: &TaskSplit, e: PipelineError) -> PipelineError {
        match e {
            PipelineError::FatalCopy { .. } | PipelineError::Cancelled => e,
            other => PipelineError::FatalCopy {
                job_id: self.job_id.clone(),
                split_id: split.split_id.clone(),
                message: other.to_string(),
            },
        }
    }

    fn request(&self, split: &TaskSplit) -> ScanRequest {
        match &split.range {
            SplitRange::Keyed { key_column, range } => ScanRequest::Keyed {
                key_column: key_column.clone(),
                range: range.clone(),
                after: match &split.cursor {
                    SplitCursor::AfterKey(key) => Some(key.clone()),
                    _ => None,
                },
                limit: self.batch_size,
            },
            SplitRange::FullTable { order_by } => ScanRequest::Paged {
                order_by: order_by.clone(),
                offset: match split.cursor {
                    SplitCursor::Offset(n) => n,
                    _ => 0,
                },
                limit: self.batch_size,
            },
        }
    }

    fn next_cursor(split: &TaskSplit, rows: &[Row]) -> Result<SplitCursor> {
        match &split.range {
            SplitRange::Keyed { key_column, .. } => {
                let key = rows
                    .last()
                    .and_then(|r| r.get_by_name(key_column))
                    .cloned()
                    .ok_or_else(|| {
                        PipelineError::routing(format!("row of split {} has no key column '{key_column}'", split.split_id))
                    })?;
                Ok(SplitCursor::AfterKey(key))
            }
            SplitRange::FullTable { .. } => {
                let done = match split.cursor {
                    SplitCursor::Offset(n) => n,
                    _ => 0,
                };
                Ok(SplitCursor::Offset(done + rows.len() as u64))
            }
        }
    }

    fn write_ops(&self, rows: Vec<Row>) -> Result<Vec<Vec<WriteOp>>> {
        let mut per_node: Vec<Vec<WriteOp>> = vec![Vec::new(); self.target.router().data_nodes().len()];
        let key_columns = self.target.key_columns();
        for row in rows {
            let node = self.target.router().route_index(&row)?;
            let op = if key_columns.is_empty() {
                WriteOp::InsertIfAbsent { row }
            } else {
                WriteOp::Upsert {
                    row,
                    key_columns: key_columns.to_vec(),
                }
            };
            per_node[node].push(op);
        }
        Ok(per_node)
    }

    /// Copy `split` from its cursor to the end, or until `cancel` fires.
    ///
    /// Cancellation is observed between batches; a batch that started is
    /// written and recorded.
    pub async fn copy(
        &self,
        split: TaskSplit,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<CopyResult> {
        let started = Instant::now();
        let mut split = split;
        let mut rows_copied = 0u64;
        let mut batches = 0u64;
        // In-batch retries are not interrupted by `cancel`
        let in_batch = CancellationToken::new();

        debug!(job_id = %self.job_id, split = %split, "Copying split");
        while !split.completed && !cancel.is_cancelled() {
            let request = &self.request(&split);
            let table = &split.table.table;
            let source = &self.source;
            let rows = self
                .retry
                .run("read split", &in_batch, move || async move {
                    source
                        .scan(table, request)
                        .await
                        .map_err(PipelineError::from_database)
                })
                .await
                .map_err(|e| self.fatal(&split, e))?;

            let read = rows.len();
            if read == 0 {
                split.completed = true;
                sink.record(&split).await?;
                break;
            }
            let cursor = Self::next_cursor(&split, &rows).map_err(|e| self.fatal(&split, e))?;
            let per_node = self.write_ops(rows).map_err(|e| self.fatal(&split, e))?;

            for (idx, ops) in per_node.iter().enumerate() {
                if ops.is_empty() {
                    continue;
                }
                let (node, store) = self.target.node(idx);
                let job_id: &str = &self.job_id;
                let mut attempts = 0u32;
                self.retry
                    .run("write split batch", &in_batch, move || {
                        attempts += 1;
                        if attempts > 1 {
                            metrics::retry(job_id, "copy");
                        }
                        async move {
                            store
                                .write(&node.table, ops)
                                .await
                                .map_err(PipelineError::from_database)
                        }
                    })
                    .await
                    .map_err(|e| self.fatal(&split, e))?;
            }

            split.cursor = cursor;
            split.rows_copied += read as u64;
            split.completed = read < self.batch_size;
            rows_copied += read as u64;
            batches += 1;
            sink.record(&split).await?;
            metrics::rows_copied(&self.job_id, read as u64);
            debug!(
                job_id = %self.job_id,
                split_id = %split.split_id,
                rows = read,
                total = split.rows_copied,
                "Copied batch"
            );
        }

        let elapsed = started.elapsed();
        if split.completed {
            let secs = elapsed.as_secs_f64();
            let rate = if secs > 0.0 { rows_copied as f64 / secs } else { 0.0 };
            info!(
                job_id = %self.job_id,
                split_id = %split.split_id,
                rows = split.rows_copied,
                batches,
                rows_per_sec = rate as u64,
                "Split copied"
            );
        }
        Ok(CopyResult {
            completed: split.completed,
            split,
            rows_copied,
            batches,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry};
    use crate::routing::{SourceTable, TableRouter, TableRule};
    use crate::split::split_table;
    use parking_lot::Mutex;
    use sluice_rdbc::connection::DatabaseType;
    use sluice_rdbc::types::{ColumnMetadata, TableMetadata};
    use sluice_rdbc::{FaultKind, MemoryDatabase, TableName, Value};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<TaskSplit>>);

    #[async_trait]
    impl ProgressSink for Recorded {
        async fn record(&self, split: &TaskSplit) -> Result<()> {
            self.0.lock().push(split.clone());
            Ok(())
        }
    }

    fn columns(keyed: bool) -> Vec<ColumnMetadata> {
        let id = ColumnMetadata::new("id", "bigint");
        vec![
            if keyed { id.primary_key(1) } else { id },
            ColumnMetadata::new("v", "text"),
        ]
    }

    fn setup(keyed: bool, rows: i64) -> (MemoryDatabase, MemoryDatabase, SnapshotCopier, SourceTable) {
        let source = MemoryDatabase::new("src", DatabaseType::MySQL);
        let t = TableName::new("t");
        source.create_table(TableMetadata::new(t.clone(), columns(keyed)));
        source
            .insert_rows(
                &t,
                (0..rows).map(|id| Row::from_pairs([("id", Value::Int64(id)), ("v", Value::from(format!("r{id}")))])),
            )
            .unwrap();

        let target = MemoryDatabase::new("tgt", DatabaseType::MySQL);
        for n in ["t_0", "t_1"] {
            target.create_table(TableMetadata::new(TableName::new(n), columns(keyed)));
        }
        let table = SourceTable {
            datasource: "src".to_string(),
            table: t,
        };
        let rule = TableRule {
            source: table.clone(),
            sharding_column: "id".to_string(),
            algorithm: AlgorithmDescriptor::new("MOD").with_prop("sharding-count", 2),
            data_nodes: vec!["tgt.t_0".parse().unwrap(), "tgt.t_1".parse().unwrap()],
        };
        let router = TableRouter::new(rule, &AlgorithmRegistry::builtin()).unwrap();
        let mut targets: HashMap<String, Arc<dyn TableStore>> = HashMap::new();
        targets.insert("tgt".to_string(), Arc::new(target.clone()));
        let keys = if keyed { vec!["id".to_string()] } else { Vec::new() };
        let applier = TableApplier::new(router, keys, &targets).unwrap();
        let retry = RetryPolicy::default().with_delays(Duration::from_millis(1), Duration::from_millis(2));
        let copier = SnapshotCopier::new("job", Arc::new(source.clone()), applier, retry).with_batch_size(3);
        (source, target, copier, table)
    }

    fn target_len(target: &MemoryDatabase) -> usize {
        target.rows(&TableName::new("t_0")).len() + target.rows(&TableName::new("t_1")).len()
    }

    #[tokio::test]
    async fn test_copy_keyed_split_records_every_batch() {
        let (source, target, copier, table) = setup(true, 10);
        let metadata = source.table_metadata(&table.table).await.unwrap();
        let splits = split_table(&source, &table, &metadata, 1).await.unwrap();
        let sink = Recorded::default();

        let result = copier
            .copy(splits[0].clone(), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.completed);
        assert_eq!(result.rows_copied, 10);
        assert_eq!(result.batches, 4);
        assert_eq!(target_len(&target), 10);
        assert_eq!(target.rows(&TableName::new("t_0")).len(), 5);

        let recorded = sink.0.lock();
        assert_eq!(recorded.len(), 4);
        assert_eq!(recorded[0].cursor, SplitCursor::AfterKey(Value::Int64(2)));
        assert!(recorded[3].completed);
    }

    #[tokio::test]
    async fn test_resume_from_cursor_and_replay_are_idempotent() {
        let (source, target, copier, table) = setup(true, 9);
        let metadata = source.table_metadata(&table.table).await.unwrap();
        let mut split = split_table(&source, &table, &metadata, 1).await.unwrap().remove(0);
        split.cursor = SplitCursor::AfterKey(Value::Int64(5));
        split.rows_copied = 6;

        let sink = Recorded::default();
        let result = copier.copy(split.clone(), &sink, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.rows_copied, 3);
        // exactly one full page, so an empty read confirms the end
        assert_eq!(result.split.rows_copied, 9);
        assert_eq!(target_len(&target), 3);

        let again = copier.copy(split, &sink, &CancellationToken::new()).await.unwrap();
        assert!(again.completed);
        assert_eq!(target_len(&target), 3);
    }

    #[tokio::test]
    async fn test_keyless_split_pages_by_offset() {
        let (source, target, copier, table) = setup(false, 7);
        let metadata = source.table_metadata(&table.table).await.unwrap();
        let split = split_table(&source, &table, &metadata, 4).await.unwrap().remove(0);
        assert!(matches!(split.range, SplitRange::FullTable { .. }));

        let sink = Recorded::default();
        let result = copier.copy(split.clone(), &sink, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.split.cursor, SplitCursor::Offset(7));
        assert_eq!(target_len(&target), 7);

        copier.copy(split, &sink, &CancellationToken::new()).await.unwrap();
        assert_eq!(target_len(&target), 7);
    }

    #[tokio::test]
    async fn test_transient_write_retried_fatal_reported() {
        let (source, target, copier, table) = setup(true, 4);
        let metadata = source.table_metadata(&table.table).await.unwrap();
        let split = split_table(&source, &table, &metadata, 1).await.unwrap().remove(0);

        target.schedule_fault(0, FaultKind::Transient, 2);
        let sink = Recorded::default();
        let result = copier.copy(split.clone(), &sink, &CancellationToken::new()).await.unwrap();
        assert!(result.completed);

        target.schedule_fault(0, FaultKind::Fatal, 1);
        let err = copier.copy(split, &sink, &CancellationToken::new()).await.unwrap_err();
        match err {
            PipelineError::FatalCopy { job_id, split_id, .. } => {
                assert_eq!(job_id, "job");
                assert_eq!(split_id, "src.t#0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_copy_stops_before_next_batch() {
        let (source, target, copier, table) = setup(true, 10);
        let metadata = source.table_metadata(&table.table).await.unwrap();
        let split = split_table(&source, &table, &metadata, 1).await.unwrap().remove(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = copier.copy(split, &Recorded::default(), &cancel).await.unwrap();
        assert!(!result.completed);
        assert_eq!(result.batches, 0);
        assert_eq!(target_len(&target), 0);
    }
}
