//! # Pre-flight compatibility checks
//!
//! A job does not leave `PREPARING` until every check passes:
//!
//! 1. every source and target datasource answers `SELECT 1`
//! 2. every source has the replication capability of its dialect
//! 3. every source runs with the server settings change capture needs
//! 4. every target data node table is empty
//!
//! Privilege and variable checks are dispatched through a capability table
//! keyed by dialect name. Connectivity and query failures while checking
//! surface as [`PipelineError::PrecheckFailed`].

mod mysql;
mod postgres;

pub use mysql::MySqlChecker;
pub use postgres::PostgresChecker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_rdbc::connection::Connection;
use sluice_rdbc::store::TableStore;
use sluice_rdbc::{Row, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::routing::DataNode;

/// Dialect-specific source checks
#[async_trait]
pub trait DialectChecker: Send + Sync {
    /// Dialect the checker serves, as in [`sluice_rdbc::connection::DatabaseType::name`]
    fn dialect_name(&self) -> &'static str;

    /// The session user can read the change stream
    async fn check_privilege(&self, datasource: &str, conn: &dyn Connection) -> Result<()>;

    /// Server settings allow change capture
    async fn check_variable(&self, datasource: &str, conn: &dyn Connection) -> Result<()>;
}

/// Run a check query, turning failures into precheck errors
pub(crate) async fn query(datasource: &str, conn: &dyn Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    conn.query(sql, params)
        .await
        .map_err(|e| PipelineError::precheck(format!("{datasource}: check query failed: {e}")))
}

/// Kind of a passed check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Datasource reachable
    Connection,
    /// Replication capability
    Privilege,
    /// Server settings
    Variable,
    /// Target table empty
    TargetEmpty,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "connection",
            Self::Privilege => "privilege",
            Self::Variable => "variable",
            Self::TargetEmpty => "target_empty",
        })
    }
}

/// One passed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckItem {
    /// Datasource or data node checked
    pub subject: String,
    /// What was checked
    pub kind: CheckKind,
}

/// Checks that passed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Passed checks in execution order
    pub passed: Vec<CheckItem>,
    /// Completion time
    pub checked_at: DateTime<Utc>,
}

/// Named datasources
pub type StoreMap = BTreeMap<String, Arc<dyn TableStore>>;

/// Capability table of dialect checkers
pub struct CompatibilityChecker {
    checkers: HashMap<&'static str, Arc<dyn DialectChecker>>,
}

impl fmt::Debug for CompatibilityChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dialects: Vec<_> = self.checkers.keys().collect();
        dialects.sort();
        f.debug_struct("CompatibilityChecker")
            .field("dialects", &dialects)
            .finish()
    }
}

impl Default for CompatibilityChecker {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CompatibilityChecker {
    /// Checkers for PostgreSQL, openGauss and MySQL
    pub fn builtin() -> Self {
        let mut checker = Self {
            checkers: HashMap::new(),
        };
        checker.register(Arc::new(PostgresChecker::postgres()));
        checker.register(Arc::new(PostgresChecker::open_gauss()));
        checker.register(Arc::new(MySqlChecker));
        checker
    }

    /// Add or replace the checker of its dialect
    pub fn register(&mut self, checker: Arc<dyn DialectChecker>) {
        self.checkers.insert(checker.dialect_name(), checker);
    }

    /// Checker of `dialect`
    pub fn checker_for(&self, dialect: &str) -> Option<&Arc<dyn DialectChecker>> {
        self.checkers.get(dialect)
    }

    /// Datasource answers a trivial query
    pub async fn check_connection(&self, name: &str, store: &dyn TableStore) -> Result<()> {
        let conn = store
            .connect()
            .await
            .map_err(|e| PipelineError::precheck(format!("{name}: cannot connect: {e}")))?;
        query(name, conn.as_ref(), "SELECT 1", &[]).await?;
        Ok(())
    }

    /// Every data node table exists and has no rows
    pub async fn check_target_tables_empty(&self, targets: &StoreMap, nodes: &[DataNode]) -> Result<()> {
        for node in nodes {
            let store = targets.get(&node.datasource).ok_or_else(|| {
                PipelineError::precheck(format!("data node {node} names unknown datasource"))
            })?;
            let rows = store
                .count(&node.table)
                .await
                .map_err(|e| PipelineError::precheck(format!("cannot count target table {node}: {e}")))?;
            if rows > 0 {
                return Err(PipelineError::precheck(format!(
                    "target table {node} is not empty ({rows} rows)"
                )));
            }
        }
        Ok(())
    }

    /// Run every check; the first failure aborts
    pub async fn check(&self, sources: &StoreMap, targets: &StoreMap, target_nodes: &[DataNode]) -> Result<CheckReport> {
        let mut passed = Vec::new();
        for (name, store) in sources.iter().chain(targets.iter()) {
            self.check_connection(name, store.as_ref()).await?;
            passed.push(CheckItem {
                subject: name.clone(),
                kind: CheckKind::Connection,
            });
        }

        for (name, store) in sources {
            let dialect = store.database_type().name();
            let checker = self.checker_for(dialect).ok_or_else(|| {
                PipelineError::precheck(format!("{name}: no compatibility checker for dialect {dialect}"))
            })?;
            let conn = store
                .connect()
                .await
                .map_err(|e| PipelineError::precheck(format!("{name}: cannot connect: {e}")))?;
            checker.check_privilege(name, conn.as_ref()).await?;
            passed.push(CheckItem {
                subject: name.clone(),
                kind: CheckKind::Privilege,
            });
            checker.check_variable(name, conn.as_ref()).await?;
            passed.push(CheckItem {
                subject: name.clone(),
                kind: CheckKind::Variable,
            });
            debug!(datasource = %name, dialect, "Source checks passed");
        }

        self.check_target_tables_empty(targets, target_nodes).await?;
        passed.extend(target_nodes.iter().map(|node| CheckItem {
            subject: node.to_string(),
            kind: CheckKind::TargetEmpty,
        }));

        info!(checks = passed.len(), "Pre-flight checks passed");
        Ok(CheckReport {
            passed,
            checked_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use sluice_rdbc::connection::DatabaseType;
    use sluice_rdbc::types::{ColumnMetadata, TableMetadata};
    use sluice_rdbc::{MemoryDatabase, PgRole, TableName};

    fn stores(dbs: &[&MemoryDatabase]) -> StoreMap {
        dbs.iter()
            .map(|db| (db.name().to_string(), Arc::new((*db).clone()) as Arc<dyn TableStore>))
            .collect()
    }

    fn target() -> (MemoryDatabase, Vec<DataNode>) {
        let db = MemoryDatabase::new("tgt", DatabaseType::PostgreSQL);
        db.create_table(TableMetadata::new(
            TableName::new("t_0"),
            vec![ColumnMetadata::new("id", "bigint").primary_key(1)],
        ));
        (db, vec!["tgt.t_0".parse().unwrap()])
    }

    async fn run(source: &MemoryDatabase) -> Result<CheckReport> {
        let (tgt, nodes) = target();
        CompatibilityChecker::builtin()
            .check(&stores(&[source]), &stores(&[&tgt]), &nodes)
            .await
    }

    #[tokio::test]
    async fn test_postgres_replication_privilege() {
        let src = MemoryDatabase::new("src", DatabaseType::PostgreSQL);
        let report = run(&src).await.unwrap();
        assert_eq!(report.passed.len(), 5);

        src.update_profile(|p| p.role = Some(PgRole::default()));
        let err = run(&src).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InsufficientPrivilege);
        assert_eq!(
            err.to_string(),
            "Source data source is lack of REPLICATION privileges, you could try `ALTER ROLE \"sluice\" REPLICATION;`."
        );

        src.update_profile(|p| {
            p.role = Some(PgRole {
                rolsuper: true,
                ..Default::default()
            })
        });
        assert!(run(&src).await.is_ok());

        src.update_profile(|p| p.role = None);
        let err = run(&src).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::PrecheckFailed);
        assert!(err.to_string().contains("No role exists, rolname: sluice."));
    }

    #[tokio::test]
    async fn test_open_gauss_system_admin_and_no_variables() {
        let src = MemoryDatabase::new("src", DatabaseType::OpenGauss);
        src.update_profile(|p| {
            p.role = Some(PgRole {
                rolsystemadmin: true,
                ..Default::default()
            });
            p.variables.clear();
        });
        assert!(run(&src).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_variables() {
        let src = MemoryDatabase::new("src", DatabaseType::PostgreSQL);
        src.update_profile(|p| {
            p.variables.insert("wal_level".into(), "replica".into());
        });
        match run(&src).await.unwrap_err() {
            PipelineError::UnsupportedServerConfig { variable, actual, .. } => {
                assert_eq!(variable, "wal_level");
                assert_eq!(actual, "replica");
            }
            other => panic!("unexpected: {other}"),
        }

        let src = MemoryDatabase::new("src", DatabaseType::MySQL);
        assert!(run(&src).await.is_ok());
        src.update_profile(|p| {
            p.variables.insert("binlog_row_image".into(), "MINIMAL".into());
        });
        let err = run(&src).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::UnsupportedServerConfig);
    }

    #[tokio::test]
    async fn test_mysql_grants() {
        let src = MemoryDatabase::new("src", DatabaseType::MySQL);
        src.update_profile(|p| p.grants = vec!["GRANT SELECT ON *.* TO `sluice`@`%`".to_string()]);
        let err = run(&src).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InsufficientPrivilege);
    }

    #[tokio::test]
    async fn test_unreachable_and_non_empty_target() {
        let src = MemoryDatabase::new("src", DatabaseType::PostgreSQL);
        src.update_profile(|p| p.reachable = false);
        assert_eq!(run(&src).await.unwrap_err().class(), ErrorClass::PrecheckFailed);

        let src = MemoryDatabase::new("src", DatabaseType::PostgreSQL);
        let (tgt, nodes) = target();
        tgt.insert_rows(&TableName::new("t_0"), [Row::from_pairs([("id", 1i64)])])
            .unwrap();
        let err = CompatibilityChecker::builtin()
            .check(&stores(&[&src]), &stores(&[&tgt]), &nodes)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is not empty"));
    }
}
