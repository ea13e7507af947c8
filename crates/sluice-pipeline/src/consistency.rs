//! # Consistency verification
//!
//! Compares a source table with the union of its target data nodes.
//!
//! - [`VerifyMode::Count`]: row counts only
//! - [`VerifyMode::Digest`]: a SHA-256 digest of every row, keyed by primary
//!   key, so each missing, extra or different key is reported. Keyless tables
//!   compare the multisets of row digests and list no keys.
//!
//! Verification reads both sides and never repairs anything.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sluice_rdbc::store::{ScanRequest, TableStore};
use sluice_rdbc::{Row, TableName};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::incremental::TableApplier;
use crate::position::Position;
use crate::routing::SourceTable;
use crate::stream::ChangeStreamReader;

fn default_page_size() -> usize {
    5000
}

fn default_max_reported_keys() -> usize {
    1000
}

fn default_drain_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

/// How thoroughly tables are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Compare row counts
    Count,
    /// Compare per-row digests
    #[default]
    Digest,
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Count => "count",
            Self::Digest => "digest",
        })
    }
}

impl std::str::FromStr for VerifyMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "digest" => Ok(Self::Digest),
            other => Err(PipelineError::config(format!("unknown verify mode '{other}'"))),
        }
    }
}

/// Consistency check settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Mode used when none is requested
    #[serde(default)]
    pub mode: VerifyMode,
    /// Rows per read
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Upper bound on reported mismatched keys per table
    #[serde(default = "default_max_reported_keys")]
    pub max_reported_keys: usize,
    /// How long to wait for the engine to catch up before verifying
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Catch-up poll period
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            mode: VerifyMode::default(),
            page_size: default_page_size(),
            max_reported_keys: default_max_reported_keys(),
            drain_timeout_ms: default_drain_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ConsistencyConfig {
    /// Catch-up wait limit
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Catch-up poll period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Why a key is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// In the source only
    MissingInTarget,
    /// In the target only, or on more than one data node
    ExtraInTarget,
    /// On both sides with different content
    ContentDiffers,
}

/// One reported key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchedKey {
    /// Canonical primary key text, `col=value` pairs
    pub key: String,
    /// What differs
    pub kind: MismatchKind,
}

/// Outcome of verifying one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Source table
    pub table: SourceTable,
    /// Mode used
    pub mode: VerifyMode,
    /// Source rows
    pub source_count: u64,
    /// Rows over every data node
    pub target_count: u64,
    /// Whether the counts agree
    pub count_matched: bool,
    /// Whether the digests agree; `None` in count mode
    pub digest_matched: Option<bool>,
    /// Keys that differ, at most `max_reported_keys`
    pub mismatched_keys: Vec<MismatchedKey>,
    /// Source rows of a keyless table that repeat another source row
    /// exactly. Each such group lands on the target once, so the counts of
    /// the table cannot match while this is non-zero.
    #[serde(default)]
    pub source_duplicate_rows: u64,
}

impl ConsistencyReport {
    /// Whether every compared property matched
    pub fn is_consistent(&self) -> bool {
        self.count_matched && self.digest_matched.unwrap_or(true)
    }
}

/// SHA-256 of a row, independent of column order and integer width
pub fn row_digest(row: &Row) -> [u8; 32] {
    let mut cells: Vec<(String, Vec<u8>)> = row
        .iter()
        .map(|(column, value)| (column.to_ascii_lowercase(), value.canonical_bytes()))
        .collect();
    cells.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Sha256::new();
    for (column, bytes) in cells {
        hasher.update((column.len() as u64).to_be_bytes());
        hasher.update(column.as_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().into()
}

fn key_text(row: &Row, key_columns: &[String]) -> Option<String> {
    let values = row.project(key_columns)?;
    Some(
        key_columns
            .iter()
            .zip(values)
            .map(|(column, value)| format!("{column}={}", value.canonical_text()))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Verifies one source table against its data nodes
pub struct ConsistencyChecker {
    source: Arc<dyn TableStore>,
    target: TableApplier,
    config: ConsistencyConfig,
}

impl fmt::Debug for ConsistencyChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistencyChecker")
            .field("source", &self.source.name())
            .field("target", &self.target)
            .field("config", &self.config)
            .finish()
    }
}

struct Side {
    count: u64,
    keyed: BTreeMap<String, [u8; 32]>,
    duplicates: Vec<String>,
    multiset: BTreeMap<[u8; 32], u64>,
}

impl Side {
    fn new() -> Self {
        Self {
            count: 0,
            keyed: BTreeMap::new(),
            duplicates: Vec::new(),
            multiset: BTreeMap::new(),
        }
    }

    fn add(&mut self, row: &Row, key_columns: &[String]) -> Result<()> {
        self.count += 1;
        let digest = row_digest(row);
        if key_columns.is_empty() {
            *self.multiset.entry(digest).or_default() += 1;
            return Ok(());
        }
        let key = key_text(row, key_columns)
            .ok_or_else(|| PipelineError::routing(format!("row lacks primary key columns {key_columns:?}")))?;
        if self.keyed.insert(key.clone(), digest).is_some() {
            self.duplicates.push(key);
        }
        Ok(())
    }

    /// Rows beyond the first of each identical group
    fn repeated_rows(&self) -> u64 {
        self.multiset.values().map(|n| n.saturating_sub(1)).sum()
    }
}

impl ConsistencyChecker {
    /// Checker of the table `target` maps
    pub fn new(source: Arc<dyn TableStore>, target: TableApplier, config: ConsistencyConfig) -> Self {
        Self { source, target, config }
    }

    /// Source table
    pub fn table(&self) -> &SourceTable {
        self.target.router().source()
    }

    async fn count(&self) -> Result<(u64, u64)> {
        let source_count = self
            .source
            .count(&self.table().table)
            .await
            .map_err(PipelineError::from_database)?;
        let mut target_count = 0;
        for idx in 0..self.target.router().data_nodes().len() {
            let (node, store) = self.target.node(idx);
            target_count += store.count(&node.table).await.map_err(PipelineError::from_database)?;
        }
        Ok((source_count, target_count))
    }

    async fn read_side(
        &self,
        store: &dyn TableStore,
        table: &TableName,
        order_by: &[String],
        side: &mut Side,
    ) -> Result<()> {
        let limit = self.config.page_size.max(1);
        let key_columns = self.target.key_columns();
        let mut offset = 0u64;
        loop {
            let request = ScanRequest::Paged {
                order_by: order_by.to_vec(),
                offset,
                limit,
            };
            let rows = store
                .scan(table, &request)
                .await
                .map_err(PipelineError::from_database)?;
            for row in &rows {
                side.add(row, key_columns)?;
            }
            debug!(table = %table, offset, rows = rows.len(), "Digested page");
            if rows.len() < limit {
                return Ok(());
            }
            offset += rows.len() as u64;
        }
    }

    /// Scan order of full-row comparisons
    async fn scan_order(&self) -> Result<Vec<String>> {
        if !self.target.key_columns().is_empty() {
            return Ok(self.target.key_columns().to_vec());
        }
        let metadata = self
            .source
            .table_metadata(&self.table().table)
            .await
            .map_err(PipelineError::from_database)?;
        Ok(metadata.column_names())
    }

    /// Exact duplicate rows of a keyless source table
    async fn keyless_source_duplicates(&self) -> Result<u64> {
        if !self.target.key_columns().is_empty() {
            return Ok(0);
        }
        let order_by = self.scan_order().await?;
        let mut source = Side::new();
        self.read_side(self.source.as_ref(), &self.table().table, &order_by, &mut source)
            .await?;
        Ok(source.repeated_rows())
    }

    fn report_keys(&self, source: &Side, target: &Side) -> Vec<MismatchedKey> {
        let mut keys = Vec::new();
        for (key, digest) in &source.keyed {
            match target.keyed.get(key) {
                None => keys.push(MismatchedKey {
                    key: key.clone(),
                    kind: MismatchKind::MissingInTarget,
                }),
                Some(other) if other != digest => keys.push(MismatchedKey {
                    key: key.clone(),
                    kind: MismatchKind::ContentDiffers,
                }),
                Some(_) => {}
            }
        }
        let extra = target
            .keyed
            .keys()
            .filter(|key| !source.keyed.contains_key(*key))
            .chain(target.duplicates.iter());
        for key in extra {
            keys.push(MismatchedKey {
                key: key.clone(),
                kind: MismatchKind::ExtraInTarget,
            });
        }
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        keys.dedup();
        keys.truncate(self.config.max_reported_keys);
        keys
    }

    /// Compare the table in `mode`
    pub async fn verify(&self, mode: VerifyMode) -> Result<ConsistencyReport> {
        let started = Instant::now();
        let table = self.table().clone();
        let report = match mode {
            VerifyMode::Count => {
                let (source_count, target_count) = self.count().await?;
                ConsistencyReport {
                    table,
                    mode,
                    source_count,
                    target_count,
                    count_matched: source_count == target_count,
                    digest_matched: None,
                    mismatched_keys: Vec::new(),
                    source_duplicate_rows: self.keyless_source_duplicates().await?,
                }
            }
            VerifyMode::Digest => {
                let order_by = self.scan_order().await?;

                let mut source = Side::new();
                self.read_side(self.source.as_ref(), &table.table, &order_by, &mut source)
                    .await?;
                let mut target = Side::new();
                for idx in 0..self.target.router().data_nodes().len() {
                    let (node, store) = self.target.node(idx);
                    self.read_side(store.as_ref(), &node.table, &order_by, &mut target)
                        .await?;
                }

                let mismatched_keys = self.report_keys(&source, &target);
                let digest_matched = if self.target.key_columns().is_empty() {
                    source.multiset == target.multiset
                } else {
                    mismatched_keys.is_empty() && source.keyed == target.keyed
                };
                ConsistencyReport {
                    table,
                    mode,
                    source_count: source.count,
                    target_count: target.count,
                    count_matched: source.count == target.count,
                    digest_matched: Some(digest_matched),
                    mismatched_keys,
                    source_duplicate_rows: source.repeated_rows(),
                }
            }
        };

        if report.source_duplicate_rows > 0 {
            warn!(
                table = %report.table,
                duplicates = report.source_duplicate_rows,
                "Keyless table has exact duplicate rows; each group is stored once on the target"
            );
        }
        if report.is_consistent() {
            info!(
                table = %report.table,
                mode = %mode,
                rows = report.source_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Table is consistent"
            );
        } else {
            warn!(
                table = %report.table,
                mode = %mode,
                source_count = report.source_count,
                target_count = report.target_count,
                mismatched = report.mismatched_keys.len(),
                "Table is inconsistent"
            );
        }
        Ok(report)
    }
}

/// Wait until `applied` covers everything the source committed when the
/// wait began.
///
/// Fails with [`PipelineError::Timeout`] once `timeout` passes.
pub async fn wait_for_drain(
    reader: &dyn ChangeStreamReader,
    applied: &mut watch::Receiver<Option<Position>>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Position> {
    let target = reader.drain_target().await?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = applied.borrow_and_update().clone();
        if reader.is_drained(&target, current.as_ref()).await? {
            debug!(reader = %reader.name(), target = %target, "Change stream drained");
            return Ok(target);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(PipelineError::Timeout(format!(
                "{} did not reach {target} within {} ms (applied {})",
                reader.name(),
                timeout.as_millis(),
                current.map_or_else(|| "nothing".to_string(), |p| p.to_string())
            )));
        }
        let wait = poll_interval.min(deadline - now);
        // A closed sender means no further progress; keep polling until the deadline
        let _ = tokio::time::timeout(wait, applied.changed()).await;
        if applied.has_changed().is_err() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Verify after the engine behind `applied` has drained `reader`
pub async fn verify_after_drain(
    checker: &ConsistencyChecker,
    mode: VerifyMode,
    reader: &dyn ChangeStreamReader,
    applied: &mut watch::Receiver<Option<Position>>,
    config: &ConsistencyConfig,
) -> Result<ConsistencyReport> {
    wait_for_drain(reader, applied, config.drain_timeout(), config.poll_interval()).await?;
    checker.verify(mode).await
}
