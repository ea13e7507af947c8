//! Translating change events into idempotent target writes

use sluice_rdbc::store::{TableStore, WriteOp};
use sluice_rdbc::{Row, TableName, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, ChangeOp};
use crate::routing::{DataNode, TableRouter};

/// Apply target of one source table
#[derive(Clone)]
pub struct TableApplier {
    router: TableRouter,
    key_columns: Vec<String>,
    stores: Vec<Arc<dyn TableStore>>,
}

impl std::fmt::Debug for TableApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableApplier")
            .field("source", self.router.source())
            .field("key_columns", &self.key_columns)
            .finish()
    }
}

/// One planned write
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedWrite {
    /// Index into the router's data nodes
    pub node: usize,
    pub op: WriteOp,
    /// Whether anything but exactly one affected row is a conflict
    pub expect_single: bool,
}

impl TableApplier {
    /// Applier writing to the stores of the router's data nodes
    pub fn new(
        router: TableRouter,
        key_columns: Vec<String>,
        targets: &HashMap<String, Arc<dyn TableStore>>,
    ) -> Result<Self> {
        let stores = router
            .data_nodes()
            .iter()
            .map(|node| {
                targets.get(&node.datasource).cloned().ok_or_else(|| {
                    PipelineError::config(format!(
                        "data node {node} names unknown target datasource '{}'",
                        node.datasource
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            router,
            key_columns,
            stores,
        })
    }

    /// The table's router
    pub fn router(&self) -> &TableRouter {
        &self.router
    }

    /// Primary key columns, empty for keyless tables
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub(crate) fn node(&self, idx: usize) -> (&DataNode, &Arc<dyn TableStore>) {
        (&self.router.data_nodes()[idx], &self.stores[idx])
    }

    fn key_of(&self, row: &Row) -> Result<Row> {
        row.select(&self.key_columns).ok_or_else(|| {
            PipelineError::routing(format!(
                "change of {} lacks primary key columns {:?}",
                self.router.source(),
                self.key_columns
            ))
        })
    }

    /// Node of a row, `None` when the image does not carry the sharding column
    fn node_of(&self, row: &Row) -> Result<Option<usize>> {
        if row.get_by_name(&self.router.rule().sharding_column).is_none() {
            return Ok(None);
        }
        self.router.route_index(row).map(Some)
    }

    fn all_nodes(&self, op: WriteOp) -> Vec<PlannedWrite> {
        (0..self.stores.len())
            .map(|node| PlannedWrite {
                node,
                op: op.clone(),
                expect_single: false,
            })
            .collect()
    }

    fn required_node(&self, row: &Row) -> Result<usize> {
        self.router.route_index(row)
    }

    /// Writes that bring the target in line with `event`
    pub(crate) fn plan(&self, event: &ChangeEvent) -> Result<Vec<PlannedWrite>> {
        let missing = |what: &str| {
            PipelineError::routing(format!(
                "{} event on {} at {} has no {what} image",
                event.op,
                self.router.source(),
                event.position
            ))
        };
        let keyed = !self.key_columns.is_empty();
        match event.op {
            ChangeOp::Insert => {
                let after = event.after.as_ref().ok_or_else(|| missing("after"))?;
                let node = self.required_node(after)?;
                let op = if keyed {
                    WriteOp::Upsert {
                        row: after.clone(),
                        key_columns: self.key_columns.clone(),
                    }
                } else {
                    WriteOp::InsertIfAbsent { row: after.clone() }
                };
                Ok(vec![PlannedWrite {
                    node,
                    op,
                    expect_single: false,
                }])
            }
            ChangeOp::Update if keyed => {
                let after = event.after.as_ref().ok_or_else(|| missing("after"))?;
                let before = event.before.as_ref().unwrap_or(after);
                let new_node = self.required_node(after)?;
                let upsert = PlannedWrite {
                    node: new_node,
                    op: WriteOp::Upsert {
                        row: after.clone(),
                        key_columns: self.key_columns.clone(),
                    },
                    expect_single: false,
                };
                let old_node = self.node_of(before)?;
                if !key_changed(before, after, &self.key_columns) && old_node.is_none_or(|n| n == new_node) {
                    return Ok(vec![upsert]);
                }
                let delete = WriteOp::DeleteMatching {
                    filter: self.key_of(before)?,
                };
                let mut writes = match old_node {
                    Some(node) => vec![PlannedWrite {
                        node,
                        op: delete,
                        expect_single: false,
                    }],
                    None => self.all_nodes(delete),
                };
                writes.push(upsert);
                Ok(writes)
            }
            ChangeOp::Update => {
                let after = event.after.as_ref().ok_or_else(|| missing("after"))?;
                let before = event.before.as_ref().ok_or_else(|| missing("before"))?;
                let old_node = self.required_node(before)?;
                let new_node = self.required_node(after)?;
                if old_node == new_node {
                    return Ok(vec![PlannedWrite {
                        node: old_node,
                        op: WriteOp::UpdateMatching {
                            before: before.clone(),
                            after: after.clone(),
                        },
                        expect_single: true,
                    }]);
                }
                Ok(vec![
                    PlannedWrite {
                        node: old_node,
                        op: WriteOp::DeleteMatching {
                            filter: before.clone(),
                        },
                        expect_single: true,
                    },
                    PlannedWrite {
                        node: new_node,
                        op: WriteOp::InsertIfAbsent { row: after.clone() },
                        expect_single: false,
                    },
                ])
            }
            ChangeOp::Delete => {
                let before = event.before.as_ref().ok_or_else(|| missing("before"))?;
                let filter = if keyed {
                    self.key_of(before)?
                } else {
                    before.clone()
                };
                let delete = WriteOp::DeleteMatching { filter };
                match self.node_of(before)? {
                    Some(node) => Ok(vec![PlannedWrite {
                        node,
                        op: delete,
                        expect_single: false,
                    }]),
                    None => Ok(self.all_nodes(delete)),
                }
            }
        }
    }
}

/// Whether an update moves the row to another primary key
pub(crate) fn key_changed(before: &Row, after: &Row, key_columns: &[String]) -> bool {
    if key_columns.is_empty() {
        return false;
    }
    match (before.project(key_columns), after.project(key_columns)) {
        (Some(old), Some(new)) => !same_values(&old, &new),
        _ => false,
    }
}

fn same_values(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.total_cmp(y) == Ordering::Equal)
}

/// A write that did not match exactly one row
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Conflict {
    pub table: TableName,
    pub node: DataNode,
    pub affected: u64,
    pub event_index: usize,
}

struct NodeBatch<'a> {
    applier: &'a TableApplier,
    node: usize,
    ops: Vec<WriteOp>,
    /// `(event index, expect_single)` per op
    meta: Vec<(usize, bool)>,
}

/// Apply a batch of events, grouped into one write per data node.
///
/// Writes keep stream order within each data node. `lookup` maps an event
/// to its table's applier; events of unmapped tables are skipped.
pub(crate) async fn apply_events<'a, F>(events: &[ChangeEvent], lookup: F) -> Result<Vec<Conflict>>
where
    F: Fn(&TableName) -> Option<&'a TableApplier>,
{
    let mut batches: Vec<NodeBatch<'a>> = Vec::new();
    for (idx, event) in events.iter().enumerate() {
        let Some(applier) = lookup(&event.table) else {
            continue;
        };
        for write in applier.plan(event)? {
            let existing = batches
                .iter_mut()
                .find(|b| std::ptr::eq(b.applier, applier) && b.node == write.node);
            let batch = match existing {
                Some(batch) => batch,
                None => {
                    batches.push(NodeBatch {
                        applier,
                        node: write.node,
                        ops: Vec::new(),
                        meta: Vec::new(),
                    });
                    let last = batches.len() - 1;
                    &mut batches[last]
                }
            };
            batch.ops.push(write.op);
            batch.meta.push((idx, write.expect_single));
        }
    }

    let mut conflicts = Vec::new();
    for batch in &batches {
        let (node, store) = batch.applier.node(batch.node);
        let affected = store
            .write(&node.table, &batch.ops)
            .await
            .map_err(PipelineError::from_database)?;
        for ((event_index, expect_single), affected) in batch.meta.iter().zip(affected) {
            if *expect_single && affected != 1 {
                conflicts.push(Conflict {
                    table: events[*event_index].table.clone(),
                    node: node.clone(),
                    affected,
                    event_index: *event_index,
                });
            }
        }
    }
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry};
    use crate::position::Position;
    use crate::routing::{SourceTable, TableRule};
    use sluice_rdbc::connection::DatabaseType;
    use sluice_rdbc::types::{ColumnMetadata, TableMetadata};
    use sluice_rdbc::MemoryDatabase;

    fn setup(keyed: bool) -> (TableApplier, MemoryDatabase) {
        let db = MemoryDatabase::new("tgt", DatabaseType::PostgreSQL);
        let mut id = ColumnMetadata::new("id", "bigint");
        if keyed {
            id = id.primary_key(1);
        }
        for name in ["t_0", "t_1"] {
            db.create_table(TableMetadata::new(
                TableName::new(name),
                vec![id.clone(), ColumnMetadata::new("v", "text")],
            ));
        }
        let rule = TableRule {
            source: SourceTable {
                datasource: "src".to_string(),
                table: TableName::new("t"),
            },
            sharding_column: "id".to_string(),
            algorithm: AlgorithmDescriptor::new("MOD").with_prop("sharding-count", 2),
            data_nodes: vec!["tgt.t_0".parse().unwrap(), "tgt.t_1".parse().unwrap()],
        };
        let router = TableRouter::new(rule, &AlgorithmRegistry::builtin()).unwrap();
        let mut targets: HashMap<String, Arc<dyn TableStore>> = HashMap::new();
        targets.insert("tgt".to_string(), Arc::new(db.clone()));
        let keys = if keyed { vec!["id".to_string()] } else { Vec::new() };
        (TableApplier::new(router, keys, &targets).unwrap(), db)
    }

    fn row(id: i64, v: &str) -> Row {
        Row::from_pairs([("id", Value::Int64(id)), ("v", Value::from(v))])
    }

    fn t() -> TableName {
        TableName::new("t")
    }

    #[tokio::test]
    async fn test_keyed_events_replay_idempotently() {
        let (applier, db) = setup(true);
        let p = Position::origin();
        let events = vec![
            ChangeEvent::insert(p.clone(), t(), row(1, "a")),
            ChangeEvent::insert(p.clone(), t(), row(2, "b")),
            ChangeEvent::update(p.clone(), t(), row(1, "a"), row(3, "c")),
            ChangeEvent::delete(p.clone(), t(), row(2, "b")),
        ];
        for _ in 0..2 {
            let conflicts = apply_events(&events, |_| Some(&applier)).await.unwrap();
            assert!(conflicts.is_empty());
        }
        assert!(db.rows(&TableName::new("t_0")).is_empty());
        assert_eq!(db.rows(&TableName::new("t_1")), vec![row(3, "c")]);
    }

    #[test]
    fn test_key_change_moves_row_between_nodes() {
        let (applier, _) = setup(true);
        let event = ChangeEvent::update(Position::origin(), t(), row(1, "a"), row(2, "a"));
        let writes = applier.plan(&event).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].node, 1);
        assert!(matches!(writes[0].op, WriteOp::DeleteMatching { .. }));
        assert_eq!(writes[1].node, 0);
    }

    #[tokio::test]
    async fn test_keyless_update_reports_conflict() {
        let (applier, db) = setup(false);
        db.insert_rows(&TableName::new("t_1"), [row(1, "a"), row(1, "a")]).unwrap();
        let event = ChangeEvent::update(Position::origin(), t(), row(1, "a"), row(1, "b"));
        let conflicts = apply_events(std::slice::from_ref(&event), |_| Some(&applier))
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].affected, 2);

        let missing = ChangeEvent::update(Position::origin(), t(), row(5, "x"), row(5, "y"));
        let conflicts = apply_events(&[missing], |_| Some(&applier)).await.unwrap();
        assert_eq!(conflicts[0].affected, 0);
    }

    #[test]
    fn test_delete_without_sharding_column_targets_every_node() {
        let (keyed, _) = setup(true);
        let mut rule = keyed.router().rule().clone();
        rule.sharding_column = "v".to_string();
        rule.algorithm = AlgorithmDescriptor::new("HASH_MOD").with_prop("sharding-count", 2);
        let router = TableRouter::new(rule, &AlgorithmRegistry::builtin()).unwrap();
        let applier = TableApplier {
            router,
            key_columns: vec!["id".to_string()],
            stores: keyed.stores.clone(),
        };

        let key_only = Row::from_pairs([("id", Value::Int64(4))]);
        let writes = applier
            .plan(&ChangeEvent::delete(Position::origin(), t(), key_only.clone()))
            .unwrap();
        assert_eq!(writes.len(), 2);
        assert!(writes
            .iter()
            .all(|w| w.op == WriteOp::DeleteMatching { filter: key_only.clone() }));

        let full = applier
            .plan(&ChangeEvent::delete(Position::origin(), t(), row(4, "x")))
            .unwrap();
        assert_eq!(full.len(), 1);
    }

    #[test]
    fn test_key_changed() {
        let keys = vec!["id".to_string()];
        assert!(key_changed(&row(1, "a"), &row(2, "a"), &keys));
        assert!(!key_changed(&row(1, "a"), &row(1, "b"), &keys));
        assert!(!key_changed(&row(1, "a"), &row(2, "a"), &[]));
    }
}
