//! Row change events delivered by change stream readers

use serde::{Deserialize, Serialize};
use sluice_rdbc::{Row, TableName};
use std::fmt;

use crate::position::Position;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// New row
    Insert,
    /// Changed row
    Update,
    /// Removed row
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("INSERT"),
            Self::Update => f.write_str("UPDATE"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// One row change at a stream position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Stream position of the change
    pub position: Position,
    /// Source table
    pub table: TableName,
    /// Change kind
    pub op: ChangeOp,
    /// Row image before the change (update, delete)
    pub before: Option<Row>,
    /// Row image after the change (insert, update)
    pub after: Option<Row>,
}

impl ChangeEvent {
    /// Insert event
    pub fn insert(position: Position, table: TableName, after: Row) -> Self {
        Self {
            position,
            table,
            op: ChangeOp::Insert,
            before: None,
            after: Some(after),
        }
    }

    /// Update event
    pub fn update(position: Position, table: TableName, before: Row, after: Row) -> Self {
        Self {
            position,
            table,
            op: ChangeOp::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    /// Delete event
    pub fn delete(position: Position, table: TableName, before: Row) -> Self {
        Self {
            position,
            table,
            op: ChangeOp::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// The image that identifies the row before the change took effect
    pub fn identity_image(&self) -> Option<&Row> {
        self.before.as_ref().or(self.after.as_ref())
    }

    /// Same event at another position
    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }
}
