//! MySQL binlog replication checks

use async_trait::async_trait;
use sluice_rdbc::connection::Connection;
use sluice_rdbc::Value;
use tracing::info;

use super::{query, DialectChecker};
use crate::error::{PipelineError, Result};

/// `(variable, required value)`
const REQUIRED_VARIABLES: &[(&str, &str)] = &[
    ("log_bin", "ON"),
    ("binlog_format", "ROW"),
    ("binlog_row_image", "FULL"),
];

/// Checks for MySQL
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlChecker;

fn grants_binlog_access(grants: &[String]) -> bool {
    grants.iter().any(|line| {
        let line = line.to_ascii_uppercase();
        line.contains("ALL PRIVILEGES ON *.*")
            || (line.contains("REPLICATION SLAVE") && line.contains("REPLICATION CLIENT"))
    })
}

#[async_trait]
impl DialectChecker for MySqlChecker {
    fn dialect_name(&self) -> &'static str {
        "MySQL"
    }

    async fn check_privilege(&self, datasource: &str, conn: &dyn Connection) -> Result<()> {
        let grants: Vec<String> = query(datasource, conn, "SHOW GRANTS", &[])
            .await?
            .iter()
            .filter_map(|r| r.get(0).and_then(Value::as_string))
            .collect();
        info!(datasource, grants = grants.len(), "Checked binlog grants");
        if grants_binlog_access(&grants) {
            Ok(())
        } else {
            Err(PipelineError::InsufficientPrivilege(format!(
                "Source data source {datasource} is lack of REPLICATION SLAVE, REPLICATION CLIENT privileges, \
                 you could try `GRANT REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO <user>;`."
            )))
        }
    }

    async fn check_variable(&self, datasource: &str, conn: &dyn Connection) -> Result<()> {
        for (variable, required) in REQUIRED_VARIABLES {
            let sql = format!("SHOW VARIABLES LIKE '{variable}'");
            let actual = query(datasource, conn, &sql, &[])
                .await?
                .first()
                .and_then(|r| r.get_by_name("Value").or_else(|| r.get(1)))
                .and_then(Value::as_string)
                .unwrap_or_default();
            if !actual.eq_ignore_ascii_case(required) {
                return Err(PipelineError::UnsupportedServerConfig {
                    datasource: datasource.to_string(),
                    variable: (*variable).to_string(),
                    actual,
                    required: (*required).to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_lines() {
        assert!(grants_binlog_access(&["GRANT ALL PRIVILEGES ON *.* TO `root`@`%`".to_string()]));
        assert!(grants_binlog_access(&[
            "GRANT SELECT, REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO `u`@`%`".to_string()
        ]));
        assert!(!grants_binlog_access(&["GRANT REPLICATION SLAVE ON *.* TO `u`@`%`".to_string()]));
        assert!(!grants_binlog_access(&["GRANT ALL PRIVILEGES ON `shop`.* TO `u`@`%`".to_string()]));
    }
}
