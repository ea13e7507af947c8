//! PostgreSQL and openGauss replication checks

use async_trait::async_trait;
use sluice_rdbc::connection::Connection;
use sluice_rdbc::{Row, Value};
use tracing::info;

use super::{query, DialectChecker};
use crate::error::{PipelineError, Result};

const CURRENT_USER_SQL: &str = "SELECT current_user AS user_name";
const PG_ROLE_SQL: &str =
    "SELECT rolsuper::text AS rolsuper, rolreplication::text AS rolreplication FROM pg_roles WHERE rolname = $1";
const OPENGAUSS_ROLE_SQL: &str = "SELECT rolsuper::text AS rolsuper, rolreplication::text AS rolreplication, \
     rolsystemadmin::text AS rolsystemadmin FROM pg_roles WHERE rolname = $1";

/// Checks for the PostgreSQL family
#[derive(Debug, Clone, Copy)]
pub struct PostgresChecker {
    open_gauss: bool,
}

impl PostgresChecker {
    /// PostgreSQL checker: replication role and `wal_level = logical`
    pub const fn postgres() -> Self {
        Self { open_gauss: false }
    }

    /// openGauss checker: replication or system administrator role; no
    /// server variable constraint
    pub const fn open_gauss() -> Self {
        Self { open_gauss: true }
    }

    fn role_flags(&self) -> &'static [&'static str] {
        if self.open_gauss {
            &["rolsuper", "rolreplication", "rolsystemadmin"]
        } else {
            &["rolsuper", "rolreplication"]
        }
    }
}

fn flag(row: &Row, column: &str) -> bool {
    row.get_by_name(column)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[async_trait]
impl DialectChecker for PostgresChecker {
    fn dialect_name(&self) -> &'static str {
        if self.open_gauss {
            "openGauss"
        } else {
            "PostgreSQL"
        }
    }

    async fn check_privilege(&self, datasource: &str, conn: &dyn Connection) -> Result<()> {
        let user = query(datasource, conn, CURRENT_USER_SQL, &[])
            .await?
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_string)
            .ok_or_else(|| PipelineError::precheck(format!("{datasource}: cannot determine session user")))?;

        let sql = if self.open_gauss { OPENGAUSS_ROLE_SQL } else { PG_ROLE_SQL };
        let rows = query(datasource, conn, sql, &[Value::from(user.as_str())]).await?;
        let Some(role) = rows.first() else {
            return Err(PipelineError::precheck(format!("No role exists, rolname: {user}.")));
        };
        let flags: Vec<(&str, bool)> = self
            .role_flags()
            .iter()
            .map(|column| (*column, flag(role, column)))
            .collect();
        info!(datasource, user = %user, ?flags, "Checked replication role");
        if flags.iter().any(|(_, granted)| *granted) {
            Ok(())
        } else {
            Err(PipelineError::InsufficientPrivilege(format!(
                "Source data source is lack of REPLICATION privileges, you could try `ALTER ROLE \"{user}\" REPLICATION;`."
            )))
        }
    }

    async fn check_variable(&self, datasource: &str, conn: &dyn Connection) -> Result<()> {
        if self.open_gauss {
            return Ok(());
        }
        let actual = query(datasource, conn, "SHOW wal_level", &[])
            .await?
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_string)
            .unwrap_or_default();
        if actual.eq_ignore_ascii_case("logical") {
            Ok(())
        } else {
            Err(PipelineError::UnsupportedServerConfig {
                datasource: datasource.to_string(),
                variable: "wal_level".to_string(),
                actual,
                required: "logical".to_string(),
            })
        }
    }
}
