//! Task splitting for the snapshot phase
//!
//! A table is cut into disjoint, ordered splits from a single bounds probe:
//!
//! - integer single-column key: `MIN..=MAX` divided into nearly equal ranges,
//!   the outer ends left unbounded so the union is the whole key domain
//! - other single-column key: one keyed split over the whole table
//! - composite or missing key: one whole-table split with a row offset cursor
//! - empty table: no splits

use serde::{Deserialize, Serialize};
use sluice_rdbc::store::TableStore;
use sluice_rdbc::types::{KeyRange, TableMetadata};
use sluice_rdbc::Value;
use std::fmt;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::routing::SourceTable;

/// How a split selects its rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitRange {
    /// Rows whose key column falls in `range`, read in key order
    Keyed {
        /// Single ordering key column
        key_column: String,
        /// `[lower, upper)`; unbounded ends are `None`
        range: KeyRange,
    },
    /// Every row, read in `order_by` order in offset pages
    FullTable {
        /// Deterministic ordering columns
        order_by: Vec<String>,
    },
}

/// Copy progress inside a split
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SplitCursor {
    /// Nothing copied yet
    #[default]
    Start,
    /// Rows up to and including this key are copied
    AfterKey(Value),
    /// This many rows are copied
    Offset(u64),
}

/// One unit of snapshot copy work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSplit {
    /// Stable id, `<datasource>.<table>#<n>`
    pub split_id: String,
    /// Source table
    pub table: SourceTable,
    /// Row selection; immutable once created
    pub range: SplitRange,
    /// Position among the table's splits
    pub slot: usize,
    /// Copy progress
    #[serde(default)]
    pub cursor: SplitCursor,
    /// Whether every row of the split is copied
    #[serde(default)]
    pub completed: bool,
    /// Rows written so far
    #[serde(default)]
    pub rows_copied: u64,
}

impl TaskSplit {
    fn new(table: &SourceTable, slot: usize, range: SplitRange) -> Self {
        Self {
            split_id: format!("{table}#{slot}"),
            table: table.clone(),
            range,
            slot,
            cursor: SplitCursor::Start,
            completed: false,
            rows_copied: 0,
        }
    }
}

impl fmt::Display for TaskSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            SplitRange::Keyed { key_column, range } => {
                write!(f, "{} {key_column} in {range}", self.split_id)
            }
            SplitRange::FullTable { .. } => write!(f, "{} (full table)", self.split_id),
        }
    }
}

/// Cut `table` into at most `parallelism` splits
pub async fn split_table(
    store: &dyn TableStore,
    table: &SourceTable,
    metadata: &TableMetadata,
    parallelism: usize,
) -> Result<Vec<TaskSplit>> {
    let keys = metadata.primary_key_columns();
    let splits = match keys.as_slice() {
        [key] => {
            let bounds = store
                .key_bounds(&table.table, &key.name)
                .await
                .map_err(PipelineError::from_database)?;
            if bounds.row_count == 0 {
                Vec::new()
            } else {
                let integer_bounds = bounds
                    .min
                    .as_ref()
                    .zip(bounds.max.as_ref())
                    .and_then(|(lo, hi)| Some((lo.as_i64()?, hi.as_i64()?)))
                    .filter(|_| key.is_integer_type() || bounds.min.as_ref().is_some_and(Value::is_integer));
                match integer_bounds {
                    Some((min, max)) => integer_ranges(min, max, parallelism)
                        .into_iter()
                        .enumerate()
                        .map(|(slot, range)| {
                            TaskSplit::new(
                                table,
                                slot,
                                SplitRange::Keyed {
                                    key_column: key.name.clone(),
                                    range,
                                },
                            )
                        })
                        .collect(),
                    None => vec![TaskSplit::new(
                        table,
                        0,
                        SplitRange::Keyed {
                            key_column: key.name.clone(),
                            range: KeyRange::full(),
                        },
                    )],
                }
            }
        }
        keys => {
            let rows = store
                .count(&table.table)
                .await
                .map_err(PipelineError::from_database)?;
            if rows == 0 {
                Vec::new()
            } else {
                let order_by = if keys.is_empty() {
                    metadata.column_names()
                } else {
                    metadata.primary_key_names()
                };
                vec![TaskSplit::new(table, 0, SplitRange::FullTable { order_by })]
            }
        }
    };
    debug!(table = %table, splits = splits.len(), "split table");
    Ok(splits)
}

/// Divide `min..=max` into at most `parallelism` contiguous ranges whose
/// union is the whole `i64` domain
pub fn integer_ranges(min: i64, max: i64, parallelism: usize) -> Vec<KeyRange> {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    let domain = i128::from(max) - i128::from(min) + 1;
    let count = (parallelism.max(1) as i128).min(domain);
    let mut bounds: Vec<Option<Value>> = Vec::with_capacity(count as usize + 1);
    bounds.push(None);
    for i in 1..count {
        let b = i128::from(min) + domain * i / count;
        // b lies in (min, max], so it fits in i64
        bounds.push(i64::try_from(b).ok().map(Value::Int64));
    }
    bounds.push(None);
    bounds
        .windows(2)
        .map(|w| KeyRange::new(w[0].clone(), w[1].clone()))
        .collect()
}
