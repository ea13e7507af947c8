//! Typed table access used by the migration pipeline
//!
//! [`TableStore`] is the seam between pipeline components and a datasource.
//! [`SqlTableStore`] implements it over a [`ConnectionPool`] and a
//! [`SqlDialect`]; `MemoryDatabase` implements it in process.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::connection::{Connection, DatabaseType};
use crate::dialect::{dialect_for, SqlDialect, Statement};
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::types::{ColumnMetadata, KeyBounds, KeyRange, Row, TableMetadata, TableName, Value};

/// One page request of a table scan
#[derive(Debug, Clone, PartialEq)]
pub enum ScanRequest {
    /// Rows ordered by a single key column, within `range`, strictly after `after`
    Keyed {
        /// Ordering key column
        key_column: String,
        /// Key range the rows must fall in
        range: KeyRange,
        /// Exclusive cursor
        after: Option<Value>,
        /// Page size
        limit: usize,
    },
    /// Rows ordered by `order_by`, skipping `offset` rows
    Paged {
        /// Ordering columns
        order_by: Vec<String>,
        /// Rows to skip
        offset: u64,
        /// Page size
        limit: usize,
    },
}

/// A single write inside a [`TableStore::write`] batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert, or replace the non-key columns of the row with the same key
    Upsert {
        /// Full row image
        row: Row,
        /// Key columns identifying the row
        key_columns: Vec<String>,
    },
    /// Insert unless a row equal in every column exists
    InsertIfAbsent {
        /// Full row image
        row: Row,
    },
    /// Replace rows equal in every column to `before` with `after`
    UpdateMatching {
        /// Columns and values a row must match
        before: Row,
        /// New row image
        after: Row,
    },
    /// Delete rows equal in every column of `filter`.
    ///
    /// With a key-only filter this deletes by primary key.
    DeleteMatching {
        /// Columns and values a row must match
        filter: Row,
    },
}

/// Typed access to the tables of one datasource
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Datasource name
    fn name(&self) -> &str;

    /// Database product behind the store
    fn database_type(&self) -> DatabaseType;

    /// Open a raw session for catalog and introspection queries
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Check that the datasource answers
    async fn ping(&self) -> Result<()> {
        let conn = self.connect().await?;
        conn.query("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Column and key metadata of a table
    async fn table_metadata(&self, table: &TableName) -> Result<TableMetadata>;

    /// Minimum, maximum and count for a key column, in one probe
    async fn key_bounds(&self, table: &TableName, key_column: &str) -> Result<KeyBounds>;

    /// Read one page of rows
    async fn scan(&self, table: &TableName, request: &ScanRequest) -> Result<Vec<Row>>;

    /// Row count of a table
    async fn count(&self, table: &TableName) -> Result<u64>;

    /// Apply `ops` atomically, returning the affected row count of each op
    async fn write(&self, table: &TableName, ops: &[WriteOp]) -> Result<Vec<u64>>;

    /// Delete every row of a table, returning the number removed
    async fn clear(&self, table: &TableName) -> Result<u64>;
}

/// [`TableStore`] over SQL connections
pub struct SqlTableStore {
    name: String,
    database_type: DatabaseType,
    pool: Arc<ConnectionPool>,
    dialect: Box<dyn SqlDialect>,
    metadata: RwLock<HashMap<TableName, TableMetadata>>,
}

impl std::fmt::Debug for SqlTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTableStore")
            .field("name", &self.name)
            .field("database_type", &self.database_type)
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

impl SqlTableStore {
    /// Create a store over a pool for the given product
    pub fn new(
        name: impl Into<String>,
        database_type: DatabaseType,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            name: name.into(),
            database_type,
            pool,
            dialect: dialect_for(database_type),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// The dialect in use
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    fn statement_for(&self, table: &TableName, op: &WriteOp) -> Result<Statement> {
        Ok(match op {
            WriteOp::Upsert { row, key_columns } => {
                self.dialect.upsert(table, row, key_columns)?
            }
            WriteOp::InsertIfAbsent { row } => self.dialect.insert_if_absent(table, row),
            WriteOp::UpdateMatching { before, after } => {
                self.dialect.update_matching(table, before, after)
            }
            WriteOp::DeleteMatching { filter } => self.dialect.delete_matching(table, filter),
        })
    }
}

fn column_from_row(row: &Row) -> Result<ColumnMetadata> {
    let name = row
        .get_by_name("column_name")
        .and_then(Value::as_string)
        .ok_or_else(|| Error::schema("catalog row without column_name"))?;
    let type_name = row
        .get_by_name("data_type")
        .and_then(Value::as_string)
        .unwrap_or_default();
    let mut column = ColumnMetadata::new(name, type_name);
    column.nullable = row
        .get_by_name("nullable")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    column.ordinal = row
        .get_by_name("ordinal_position")
        .and_then(Value::as_i64)
        .unwrap_or(0) as u32;
    column.primary_key_ordinal = row
        .get_by_name("pk_ordinal")
        .and_then(Value::as_i64)
        .map(|o| o as u32);
    Ok(column)
}

fn count_from_row(row: Option<&Row>, column: &str) -> u64 {
    row.and_then(|r| r.get_by_name(column))
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0) as u64
}

#[async_trait]
impl TableStore for SqlTableStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.pool.get().await?))
    }

    async fn table_metadata(&self, table: &TableName) -> Result<TableMetadata> {
        if let Some(cached) = self.metadata.read().get(table) {
            return Ok(cached.clone());
        }
        let stmt = self.dialect.list_columns(table);
        let conn = self.pool.get().await?;
        let rows = conn.query(&stmt.sql, &stmt.params).await?;
        if rows.is_empty() {
            return Err(Error::table_not_found(table.to_string()));
        }
        let columns = rows
            .iter()
            .map(column_from_row)
            .collect::<Result<Vec<_>>>()?;
        let metadata = TableMetadata::new(table.clone(), columns);
        self.metadata
            .write()
            .insert(table.clone(), metadata.clone());
        Ok(metadata)
    }

    async fn key_bounds(&self, table: &TableName, key_column: &str) -> Result<KeyBounds> {
        let stmt = self.dialect.key_bounds(table, key_column);
        let conn = self.pool.get().await?;
        let row = conn.query_one(&stmt.sql, &stmt.params).await?;
        let min = row
            .as_ref()
            .and_then(|r| r.get_by_name("min_key"))
            .filter(|v| !v.is_null())
            .cloned();
        let max = row
            .as_ref()
            .and_then(|r| r.get_by_name("max_key"))
            .filter(|v| !v.is_null())
            .cloned();
        Ok(KeyBounds {
            min,
            max,
            row_count: count_from_row(row.as_ref(), "row_count"),
        })
    }

    async fn scan(&self, table: &TableName, request: &ScanRequest) -> Result<Vec<Row>> {
        let stmt = self.dialect.scan(table, request);
        let conn = self.pool.get().await?;
        conn.query(&stmt.sql, &stmt.params).await
    }

    async fn count(&self, table: &TableName) -> Result<u64> {
        let stmt = self.dialect.count(table);
        let conn = self.pool.get().await?;
        let row = conn.query_one(&stmt.sql, &stmt.params).await?;
        Ok(count_from_row(row.as_ref(), "row_count"))
    }

    async fn write(&self, table: &TableName, ops: &[WriteOp]) -> Result<Vec<u64>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let statements = ops
            .iter()
            .map(|op| self.statement_for(table, op))
            .collect::<Result<Vec<_>>>()?;

        let conn = self.pool.get().await?;
        let tx = conn.begin().await?;
        let mut affected = Vec::with_capacity(statements.len());
        for stmt in &statements {
            match tx.execute(&stmt.sql, &stmt.params).await {
                Ok(n) => affected.push(n),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        debug!(datasource = %self.name, error = %rollback, "rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn clear(&self, table: &TableName) -> Result<u64> {
        let stmt = self.dialect.delete_all(table);
        let conn = self.pool.get().await?;
        conn.execute(&stmt.sql, &stmt.params).await
    }
}
