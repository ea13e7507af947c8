//! In-process database
//!
//! [`MemoryDatabase`] implements [`TableStore`] over rows held in memory and
//! answers the catalog queries the compatibility checks issue (`pg_roles`,
//! `SHOW GRANTS`, server variables) from a configurable [`ServerProfile`].
//! Write faults can be scheduled to exercise retry and restart paths.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::connection::{Connection, DatabaseType, Transaction};
use crate::error::{Error, Result};
use crate::store::{ScanRequest, TableStore, WriteOp};
use crate::types::{KeyBounds, Row, TableMetadata, TableName, Value};

/// Role attributes as stored in `pg_roles`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgRole {
    /// Superuser
    pub rolsuper: bool,
    /// Replication attribute
    pub rolreplication: bool,
    /// openGauss system administrator
    pub rolsystemadmin: bool,
}

/// Server-side answers to introspection queries
#[derive(Debug, Clone)]
pub struct ServerProfile {
    /// Session user
    pub user: String,
    /// Role row returned from `pg_roles`; `None` means no such role
    pub role: Option<PgRole>,
    /// Lines returned by `SHOW GRANTS`
    pub grants: Vec<String>,
    /// Server variables
    pub variables: HashMap<String, String>,
    /// Whether the server answers at all
    pub reachable: bool,
}

impl ServerProfile {
    /// A profile that passes every replication check for `database_type`
    pub fn replication_ready(database_type: DatabaseType) -> Self {
        let mut variables = HashMap::new();
        match database_type {
            DatabaseType::PostgreSQL | DatabaseType::OpenGauss => {
                variables.insert("wal_level".to_string(), "logical".to_string());
            }
            DatabaseType::MySQL => {
                variables.insert("log_bin".to_string(), "ON".to_string());
                variables.insert("binlog_format".to_string(), "ROW".to_string());
                variables.insert("binlog_row_image".to_string(), "FULL".to_string());
            }
        }
        Self {
            user: "sluice".to_string(),
            role: Some(PgRole {
                rolreplication: true,
                ..Default::default()
            }),
            grants: vec![
                "GRANT SELECT, REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO `sluice`@`%`"
                    .to_string(),
            ],
            variables,
            reachable: true,
        }
    }
}

/// Kind of a scheduled write fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retriable connection error, nothing applied
    Transient,
    /// Non-retriable error, nothing applied
    Fatal,
    /// The batch commits, then a non-retriable error is reported
    FatalAfterCommit,
}

#[derive(Debug, Clone)]
struct ScheduledFault {
    after_writes: u64,
    kind: FaultKind,
    remaining: u32,
}

#[derive(Debug)]
struct MemoryTable {
    metadata: TableMetadata,
    key_columns: Vec<String>,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn new(metadata: TableMetadata) -> Self {
        let key_columns = metadata.primary_key_names();
        Self {
            metadata,
            key_columns,
            rows: Vec::new(),
        }
    }

    fn find_key(&self, key_columns: &[String], row: &Row) -> Option<usize> {
        let key = row.project(key_columns)?;
        self.rows.iter().position(|r| {
            r.project(key_columns)
                .is_some_and(|existing| values_equal(&existing, &key))
        })
    }

    fn normalize(&self, row: &Row) -> Row {
        let columns = self.metadata.column_names();
        let values = columns
            .iter()
            .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
            .collect();
        Row::new(columns, values)
    }

    fn apply(&mut self, op: &WriteOp) -> u64 {
        match op {
            WriteOp::Upsert { row, key_columns } => {
                let row = self.normalize(row);
                match self.find_key(key_columns, &row) {
                    Some(idx) => self.rows[idx] = row,
                    None => self.rows.push(row),
                }
                1
            }
            WriteOp::InsertIfAbsent { row } => {
                let row = self.normalize(row);
                if self.rows.iter().any(|r| r.matches(&row)) {
                    0
                } else {
                    self.rows.push(row);
                    1
                }
            }
            WriteOp::UpdateMatching { before, after } => {
                let mut affected = 0;
                for existing in self.rows.iter_mut().filter(|r| r.matches(before)) {
                    for (column, value) in after.iter() {
                        existing.set(column, value.clone());
                    }
                    affected += 1;
                }
                affected
            }
            WriteOp::DeleteMatching { filter } => {
                let before = self.rows.len();
                self.rows.retain(|r| !r.matches(filter));
                (before - self.rows.len()) as u64
            }
        }
    }

    fn sorted_by(&self, columns: &[String]) -> Vec<Row> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| compare_on(a, b, columns));
        rows
    }
}

fn values_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.total_cmp(y) == Ordering::Equal)
}

fn compare_on(a: &Row, b: &Row, columns: &[String]) -> Ordering {
    for column in columns {
        let left = a.get_by_name(column).unwrap_or(&Value::Null);
        let right = b.get_by_name(column).unwrap_or(&Value::Null);
        match left.total_cmp(right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[derive(Debug)]
struct MemoryState {
    tables: BTreeMap<TableName, MemoryTable>,
    committed_writes: u64,
    faults: Vec<ScheduledFault>,
}

/// In-memory datasource
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    name: String,
    database_type: DatabaseType,
    state: Mutex<MemoryState>,
    profile: RwLock<ServerProfile>,
}

impl MemoryDatabase {
    /// Create an empty database that passes replication checks
    pub fn new(name: impl Into<String>, database_type: DatabaseType) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name: name.into(),
                database_type,
                state: Mutex::new(MemoryState {
                    tables: BTreeMap::new(),
                    committed_writes: 0,
                    faults: Vec::new(),
                }),
                profile: RwLock::new(ServerProfile::replication_ready(database_type)),
            }),
        }
    }

    /// Create (or replace) a table
    pub fn create_table(&self, metadata: TableMetadata) {
        let name = metadata.name.clone();
        self.inner
            .state
            .lock()
            .tables
            .insert(name, MemoryTable::new(metadata));
    }

    /// Insert rows directly, bypassing faults
    pub fn insert_rows(&self, table: &TableName, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::table_not_found(table.to_string()))?;
        for row in rows {
            let row = t.normalize(&row);
            if t.key_columns.is_empty() {
                t.rows.push(row);
            } else {
                let key_columns = t.key_columns.clone();
                t.apply(&WriteOp::Upsert { row, key_columns });
            }
        }
        Ok(())
    }

    /// All rows of a table, ordered by primary key (or by every column)
    pub fn rows(&self, table: &TableName) -> Vec<Row> {
        let state = self.inner.state.lock();
        match state.tables.get(table) {
            Some(t) => {
                let order = if t.key_columns.is_empty() {
                    t.metadata.column_names()
                } else {
                    t.key_columns.clone()
                };
                t.sorted_by(&order)
            }
            None => Vec::new(),
        }
    }

    /// Apply a single op directly, bypassing faults
    pub fn apply(&self, table: &TableName, op: &WriteOp) -> Result<u64> {
        let mut state = self.inner.state.lock();
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::table_not_found(table.to_string()))?;
        Ok(t.apply(op))
    }

    /// Number of write batches committed through [`TableStore::write`]
    pub fn committed_writes(&self) -> u64 {
        self.inner.state.lock().committed_writes
    }

    /// Fail `times` consecutive write batches once `after_writes` batches
    /// have committed
    pub fn schedule_fault(&self, after_writes: u64, kind: FaultKind, times: u32) {
        self.inner.state.lock().faults.push(ScheduledFault {
            after_writes,
            kind,
            remaining: times,
        });
    }

    /// Drop all scheduled faults
    pub fn clear_faults(&self) {
        self.inner.state.lock().faults.clear();
    }

    /// Replace the server profile
    pub fn set_profile(&self, profile: ServerProfile) {
        *self.inner.profile.write() = profile;
    }

    /// Modify the server profile in place
    pub fn update_profile(&self, f: impl FnOnce(&mut ServerProfile)) {
        f(&mut self.inner.profile.write());
    }

    fn take_fault(state: &mut MemoryState) -> Option<FaultKind> {
        let committed = state.committed_writes;
        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.remaining > 0 && committed >= f.after_writes)?;
        fault.remaining -= 1;
        Some(fault.kind)
    }

    fn profile(&self) -> Result<ServerProfile> {
        let profile = self.inner.profile.read().clone();
        if profile.reachable {
            Ok(profile)
        } else {
            Err(Error::connection(format!(
                "datasource {} is unreachable",
                self.inner.name
            )))
        }
    }
}

#[async_trait]
impl TableStore for MemoryDatabase {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn database_type(&self) -> DatabaseType {
        self.inner.database_type
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.profile()?;
        Ok(Box::new(MemoryConnection { db: self.clone() }))
    }

    async fn table_metadata(&self, table: &TableName) -> Result<TableMetadata> {
        self.profile()?;
        self.inner
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.metadata.clone())
            .ok_or_else(|| Error::table_not_found(table.to_string()))
    }

    async fn key_bounds(&self, table: &TableName, key_column: &str) -> Result<KeyBounds> {
        self.profile()?;
        let state = self.inner.state.lock();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::table_not_found(table.to_string()))?;
        let keys = t.rows.iter().filter_map(|r| r.get_by_name(key_column));
        let min = keys.clone().min_by(|a, b| a.total_cmp(b)).cloned();
        let max = keys.max_by(|a, b| a.total_cmp(b)).cloned();
        Ok(KeyBounds {
            min,
            max,
            row_count: t.rows.len() as u64,
        })
    }

    async fn scan(&self, table: &TableName, request: &ScanRequest) -> Result<Vec<Row>> {
        self.profile()?;
        let state = self.inner.state.lock();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::table_not_found(table.to_string()))?;
        let rows = match request {
            ScanRequest::Keyed {
                key_column,
                range,
                after,
                limit,
            } => t
                .sorted_by(std::slice::from_ref(key_column))
                .into_iter()
                .filter(|row| {
                    let Some(key) = row.get_by_name(key_column) else {
                        return false;
                    };
                    range.contains(key)
                        && after
                            .as_ref()
                            .is_none_or(|c| key.total_cmp(c) == Ordering::Greater)
                })
                .take(*limit)
                .collect(),
            ScanRequest::Paged {
                order_by,
                offset,
                limit,
            } => t
                .sorted_by(order_by)
                .into_iter()
                .skip(*offset as usize)
                .take(*limit)
                .collect(),
        };
        Ok(rows)
    }

    async fn count(&self, table: &TableName) -> Result<u64> {
        self.profile()?;
        self.inner
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| Error::table_not_found(table.to_string()))
    }

    async fn write(&self, table: &TableName, ops: &[WriteOp]) -> Result<Vec<u64>> {
        self.profile()?;
        let mut state = self.inner.state.lock();
        if !state.tables.contains_key(table) {
            return Err(Error::table_not_found(table.to_string()));
        }
        let fault = Self::take_fault(&mut state);
        match fault {
            Some(FaultKind::Transient) => {
                return Err(Error::connection("injected transient write failure"))
            }
            Some(FaultKind::Fatal) => return Err(Error::internal("injected write failure")),
            _ => {}
        }

        // Apply on a copy so the batch is all-or-nothing.
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::table_not_found(table.to_string()))?;
        let snapshot = t.rows.clone();
        let affected: Vec<u64> = ops.iter().map(|op| t.apply(op)).collect();
        if !t.key_columns.is_empty() && has_duplicate_keys(t) {
            t.rows = snapshot;
            return Err(Error::Constraint {
                message: format!("duplicate primary key in {table}"),
            });
        }
        state.committed_writes += 1;

        if fault == Some(FaultKind::FatalAfterCommit) {
            return Err(Error::internal("injected failure after commit"));
        }
        Ok(affected)
    }

    async fn clear(&self, table: &TableName) -> Result<u64> {
        self.profile()?;
        let mut state = self.inner.state.lock();
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::table_not_found(table.to_string()))?;
        let removed = t.rows.len() as u64;
        t.rows.clear();
        Ok(removed)
    }
}

fn has_duplicate_keys(t: &MemoryTable) -> bool {
    let mut seen: Vec<Vec<Value>> = Vec::with_capacity(t.rows.len());
    for row in &t.rows {
        let Some(key) = row.project(&t.key_columns) else {
            continue;
        };
        if seen.iter().any(|k| values_equal(k, &key)) {
            return true;
        }
        seen.push(key);
    }
    false
}

/// Session on a [`MemoryDatabase`] answering introspection queries
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
}

fn quoted_token(sql: &str) -> Option<String> {
    let start = sql.find('\'')? + 1;
    let end = sql[start..].find('\'')? + start;
    Some(sql[start..end].to_string())
}

impl MemoryConnection {
    fn answer(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let profile = self.db.profile()?;
        let normalized = sql.trim().to_ascii_lowercase();

        if normalized == "select 1" {
            return Ok(vec![Row::from_pairs([("?column?", 1i32)])]);
        }
        if normalized.contains("current_user") {
            return Ok(vec![Row::from_pairs([(
                "user_name",
                profile.user.as_str(),
            )])]);
        }
        if normalized.contains("from pg_roles") {
            let rolname = params
                .first()
                .and_then(Value::as_string)
                .unwrap_or_else(|| profile.user.clone());
            let flag = |b: bool| if b { "t" } else { "f" };
            return Ok(match profile.role {
                Some(role) if rolname == profile.user => {
                    let mut row = Row::from_pairs([
                        ("rolname", rolname.as_str()),
                        ("rolsuper", flag(role.rolsuper)),
                        ("rolreplication", flag(role.rolreplication)),
                    ]);
                    if self.db.database_type() == DatabaseType::OpenGauss {
                        row.set("rolsystemadmin", flag(role.rolsystemadmin));
                    }
                    vec![row]
                }
                _ => Vec::new(),
            });
        }
        if normalized.starts_with("show grants") {
            let column = format!("Grants for {}@%", profile.user);
            return Ok(profile
                .grants
                .iter()
                .map(|g| Row::from_pairs([(column.as_str(), g.as_str())]))
                .collect());
        }
        if normalized.starts_with("show variables like") {
            let name = quoted_token(sql)
                .or_else(|| params.first().and_then(Value::as_string))
                .unwrap_or_default();
            return Ok(profile
                .variables
                .get(&name)
                .map(|value| {
                    vec![Row::from_pairs([
                        ("Variable_name", name.as_str()),
                        ("Value", value.as_str()),
                    ])]
                })
                .unwrap_or_default());
        }
        if let Some(name) = normalized.strip_prefix("show ") {
            let name = name.trim_end_matches(';').trim();
            return Ok(profile
                .variables
                .get(name)
                .map(|value| vec![Row::from_pairs([(name, value.as_str())])])
                .unwrap_or_default());
        }
        Err(Error::unsupported(format!(
            "in-memory datasource cannot run: {sql}"
        )))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.answer(sql, params)
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        Err(Error::unsupported(format!(
            "in-memory datasource cannot execute: {sql}"
        )))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Err(Error::unsupported(
            "in-memory datasource has no SQL transactions",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnMetadata, KeyRange};

    fn orders() -> TableName {
        TableName::new("t_order")
    }

    fn db() -> MemoryDatabase {
        let db = MemoryDatabase::new("ds_0", DatabaseType::PostgreSQL);
        db.create_table(TableMetadata::new(
            orders(),
            vec![
                ColumnMetadata::new("order_id", "bigint").primary_key(1),
                ColumnMetadata::new("status", "text"),
            ],
        ));
        db
    }

    fn order(id: i64, status: &str) -> Row {
        Row::from_pairs([("order_id", Value::Int64(id)), ("status", Value::from(status))])
    }

    fn upsert(id: i64, status: &str) -> WriteOp {
        WriteOp::Upsert {
            row: order(id, status),
            key_columns: vec!["order_id".into()],
        }
    }

    #[tokio::test]
    async fn test_upsert_replays_idempotently() {
        let db = db();
        db.write(&orders(), &[upsert(1, "new"), upsert(2, "new")])
            .await
            .unwrap();
        db.write(&orders(), &[upsert(1, "paid"), upsert(2, "new")])
            .await
            .unwrap();
        let rows = db.rows(&orders());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_by_name("status"), Some(&Value::from("paid")));
    }

    #[tokio::test]
    async fn test_keyed_scan_respects_range_and_cursor() {
        let db = db();
        db.insert_rows(&orders(), (1..=10).map(|i| order(i, "x")))
            .unwrap();
        let page = db
            .scan(
                &orders(),
                &ScanRequest::Keyed {
                    key_column: "order_id".into(),
                    range: KeyRange::new(Some(Value::Int64(3)), Some(Value::Int64(8))),
                    after: Some(Value::Int64(4)),
                    limit: 2,
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = page
            .iter()
            .filter_map(|r| r.get_by_name("order_id").and_then(Value::as_i64))
            .collect();
        assert_eq!(ids, vec![5, 6]);

        let bounds = db.key_bounds(&orders(), "order_id").await.unwrap();
        assert_eq!(bounds.min, Some(Value::Int64(1)));
        assert_eq!(bounds.max, Some(Value::Int64(10)));
        assert_eq!(bounds.row_count, 10);
    }

    #[tokio::test]
    async fn test_fault_schedule() {
        let db = db();
        db.schedule_fault(1, FaultKind::Transient, 1);
        db.write(&orders(), &[upsert(1, "a")]).await.unwrap();
        let err = db.write(&orders(), &[upsert(2, "b")]).await.unwrap_err();
        assert!(err.is_retriable());
        db.write(&orders(), &[upsert(2, "b")]).await.unwrap();

        db.schedule_fault(2, FaultKind::FatalAfterCommit, 1);
        let err = db.write(&orders(), &[upsert(3, "c")]).await.unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(db.rows(&orders()).len(), 3);
    }

    #[tokio::test]
    async fn test_delete_and_matching_update() {
        let db = db();
        db.insert_rows(&orders(), [order(1, "a"), order(2, "b")])
            .unwrap();
        let affected = db
            .write(
                &orders(),
                &[
                    WriteOp::UpdateMatching {
                        before: order(1, "a"),
                        after: order(1, "z"),
                    },
                    WriteOp::DeleteMatching {
                        filter: Row::from_pairs([("order_id", 2i64)]),
                    },
                    WriteOp::DeleteMatching {
                        filter: Row::from_pairs([("order_id", 99i64)]),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, vec![1, 1, 0]);
        assert_eq!(db.rows(&orders()), vec![order(1, "z")]);
    }

    #[tokio::test]
    async fn test_introspection_queries() {
        let db = MemoryDatabase::new("src", DatabaseType::OpenGauss);
        let conn = db.connect().await.unwrap();
        let roles = conn
            .query("SELECT * FROM pg_roles WHERE rolname = $1", &[Value::from("sluice")])
            .await
            .unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(
            roles[0].get_by_name("rolreplication").and_then(Value::as_bool),
            Some(true)
        );
        assert!(roles[0].get_by_name("rolsystemadmin").is_some());

        let wal = conn.query("SHOW wal_level", &[]).await.unwrap();
        assert_eq!(wal[0].get_by_name("wal_level"), Some(&Value::from("logical")));

        db.update_profile(|p| p.reachable = false);
        assert!(db.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_mysql_variables_and_grants() {
        let db = MemoryDatabase::new("src", DatabaseType::MySQL);
        let conn = db.connect().await.unwrap();
        let rows = conn
            .query("SHOW VARIABLES LIKE 'binlog_format'", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get_by_name("Value"), Some(&Value::from("ROW")));
        let grants = conn.query("SHOW GRANTS", &[]).await.unwrap();
        assert_eq!(grants.len(), 1);
    }
}
