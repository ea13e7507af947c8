//! Assigning events to apply workers
//!
//! Events with the same `(table, primary key)` always go to the same
//! worker, which applies its queue in order. Keyless tables hash on the
//! table alone, so all their changes share one worker.

use super::apply::key_changed;
use crate::algorithm::stable_hash;
use crate::event::{ChangeEvent, ChangeOp};

/// Worker index of `event` among `workers`
pub(crate) fn worker_for(event: &ChangeEvent, key_columns: &[String], workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut bytes = event.table.to_string().into_bytes();
    if !key_columns.is_empty() {
        if let Some(values) = event.identity_image().and_then(|row| row.project(key_columns)) {
            for value in values {
                bytes.push(0);
                bytes.extend(value.canonical_bytes());
            }
        }
    }
    (stable_hash(&bytes) % workers as u64) as usize
}

/// Whether the event moves a row to a new key, so events before and after
/// it may hash to different workers
pub(crate) fn needs_barrier(event: &ChangeEvent, key_columns: &[String]) -> bool {
    match (event.op, &event.before, &event.after) {
        (ChangeOp::Update, Some(before), Some(after)) => key_changed(before, after, key_columns),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;
    use sluice_rdbc::{Row, TableName, Value};

    fn row(id: i64, v: &str) -> Row {
        Row::from_pairs([("id", Value::Int64(id)), ("v", Value::from(v))])
    }

    #[test]
    fn test_same_key_same_worker() {
        let keys = vec!["id".to_string()];
        let t = TableName::new("t");
        let insert = ChangeEvent::insert(Position::origin(), t.clone(), row(7, "a"));
        let update = ChangeEvent::update(Position::origin(), t.clone(), row(7, "a"), row(7, "b"));
        let delete = ChangeEvent::delete(Position::origin(), t.clone(), row(7, "b"));
        let w = worker_for(&insert, &keys, 8);
        assert_eq!(worker_for(&update, &keys, 8), w);
        assert_eq!(worker_for(&delete, &keys, 8), w);

        // keys spread over workers
        let distinct: std::collections::HashSet<usize> = (0..64)
            .map(|id| worker_for(&ChangeEvent::insert(Position::origin(), t.clone(), row(id, "x")), &keys, 8))
            .collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_keyless_table_uses_one_worker() {
        let t = TableName::new("log");
        let a = ChangeEvent::insert(Position::origin(), t.clone(), row(1, "a"));
        let b = ChangeEvent::insert(Position::origin(), t, row(2, "b"));
        assert_eq!(worker_for(&a, &[], 4), worker_for(&b, &[], 4));
    }

    #[test]
    fn test_barrier_on_key_change_only() {
        let keys = vec!["id".to_string()];
        let t = TableName::new("t");
        let moved = ChangeEvent::update(Position::origin(), t.clone(), row(1, "a"), row(2, "a"));
        let edited = ChangeEvent::update(Position::origin(), t, row(1, "a"), row(1, "b"));
        assert!(needs_barrier(&moved, &keys));
        assert!(!needs_barrier(&edited, &keys));
    }
}
