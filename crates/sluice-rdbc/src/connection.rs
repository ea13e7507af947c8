//! Connection traits for sluice-rdbc
//!
//! - [`Connection`]: statement execution plus transactions
//! - [`Transaction`]: statements that commit or roll back together
//! - [`ConnectionFactory`]: opens connections for a [`ConnectionConfig`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// A database connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the number of affected rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Begin a transaction on this connection
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Check whether the connection is still usable
    async fn is_valid(&self) -> bool {
        self.query("SELECT 1", &[]).await.is_ok()
    }

    /// Close the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a statement that returns rows inside the transaction
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement inside the transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Supported database products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL
    #[serde(alias = "postgres")]
    PostgreSQL,
    /// openGauss (PostgreSQL wire and catalog compatible)
    OpenGauss,
    /// MySQL
    MySQL,
}

impl DatabaseType {
    /// Dialect name as reported in checks and errors
    pub const fn name(self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::OpenGauss => "openGauss",
            Self::MySQL => "MySQL",
        }
    }

    /// Whether the product belongs to the PostgreSQL family
    pub const fn is_postgres_family(self) -> bool {
        matches!(self, Self::PostgreSQL | Self::OpenGauss)
    }

    /// Infer the product from a connection URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| Error::config("connection URL has no scheme"))?;
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::PostgreSQL),
            "opengauss" => Ok(Self::OpenGauss),
            "mysql" => Ok(Self::MySQL),
            other => Err(Error::config(format!("unsupported URL scheme: {other}"))),
        }
    }
}

impl FromStr for DatabaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::PostgreSQL),
            "opengauss" => Ok(Self::OpenGauss),
            "mysql" => Ok(Self::MySQL),
            other => Err(Error::config(format!("unknown database type: {other}"))),
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection configuration
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Connection URL
    pub url: String,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Statement timeout in milliseconds
    pub query_timeout_ms: u64,
    /// Application name reported to the server
    pub application_name: Option<String>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &redact_url(&self.url))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Replace the password of a URL with `***` so it can be logged
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            query_timeout_ms: 30_000,
            application_name: Some("sluice".into()),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set the statement timeout
    pub fn with_query_timeout(mut self, ms: u64) -> Self {
        self.query_timeout_ms = ms;
        self
    }

    /// Set the application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

/// Opens connections for one database product
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Product this factory connects to
    fn database_type(&self) -> DatabaseType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_from_url() {
        assert_eq!(
            DatabaseType::from_url("postgres://u@h/db").unwrap(),
            DatabaseType::PostgreSQL
        );
        assert_eq!(
            DatabaseType::from_url("opengauss://u@h/db").unwrap(),
            DatabaseType::OpenGauss
        );
        assert_eq!(
            DatabaseType::from_url("MYSQL://u@h/db").unwrap(),
            DatabaseType::MySQL
        );
        assert!(DatabaseType::from_url("oracle://h").is_err());
        assert!(DatabaseType::from_url("no-scheme").is_err());
    }

    #[test]
    fn test_database_type_serde() {
        let t: DatabaseType = serde_json::from_str("\"opengauss\"").unwrap();
        assert_eq!(t, DatabaseType::OpenGauss);
        let t: DatabaseType = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(t, DatabaseType::PostgreSQL);
        assert_eq!(DatabaseType::OpenGauss.to_string(), "openGauss");
        assert!(DatabaseType::OpenGauss.is_postgres_family());
        assert!(!DatabaseType::MySQL.is_postgres_family());
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = ConnectionConfig::new("postgres://admin:hunter2@db:5432/app")
            .with_connect_timeout(5000);
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
        assert_eq!(config.connect_timeout_ms, 5000);
    }
}
