//! PostgreSQL and openGauss backend over tokio-postgres
//!
//! Parameters are encoded against the type the server inferred for each
//! placeholder, so an `Int64` cursor can be bound to an `int4` key column
//! and textual values can target numeric, uuid or json columns.

use async_trait::async_trait;
use bytes::BytesMut;
use std::str::FromStr;
use std::sync::Arc;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tracing::warn;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Map a driver error onto the crate taxonomy
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    match e.as_db_error() {
        Some(db) => {
            let state = db.code().code().to_string();
            let mut mapped = Error::from_sql_state(&state, db.message());
            if let Error::Query { sql: stmt, .. } = &mut mapped {
                *stmt = Some(sql.to_string());
            }
            mapped
        }
        None => Error::connection_with_source("driver error", e),
    }
}

/// A [`Value`] encoded for the parameter type the server expects
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

fn integer_to_sql(n: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(n)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(n)?.to_sql(ty, out),
        Type::FLOAT4 => (n as f32).to_sql(ty, out),
        Type::FLOAT8 => (n as f64).to_sql(ty, out),
        Type::NUMERIC => rust_decimal::Decimal::from(n).to_sql(ty, out),
        Type::BOOL => (n != 0).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => n.to_string().to_sql(ty, out),
        _ => n.to_sql(ty, out),
    }
}

fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 => integer_to_sql(s.trim().parse()?, ty, out),
        Type::FLOAT4 | Type::FLOAT8 => s.trim().parse::<f64>()?.to_sql(ty, out),
        Type::NUMERIC => rust_decimal::Decimal::from_str(s.trim())?.to_sql(ty, out),
        Type::BOOL => Value::from(s)
            .as_bool()
            .ok_or_else(|| format!("invalid boolean: {s}"))?
            .to_sql(ty, out),
        Type::UUID => uuid::Uuid::parse_str(s)?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::Value::from_str(s)?.to_sql(ty, out),
        Type::DATE => chrono::NaiveDate::from_str(s)?.to_sql(ty, out),
        Type::TIMESTAMP => chrono::NaiveDateTime::from_str(s)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => chrono::DateTime::<chrono::Utc>::from_str(s)?.to_sql(ty, out),
        // Text and user-defined types (enums, domains) take raw UTF-8.
        _ => {
            out.extend_from_slice(s.as_bytes());
            Ok(IsNull::No)
        }
    }
}

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int16(n) => integer_to_sql(i64::from(*n), ty, out),
            Value::Int32(n) => integer_to_sql(i64::from(*n), ty, out),
            Value::Int64(n) => integer_to_sql(*n, ty, out),
            Value::Float64(n) => match *ty {
                Type::FLOAT4 => (*n as f32).to_sql(ty, out),
                Type::NUMERIC => rust_decimal::Decimal::try_from(*n)?.to_sql(ty, out),
                _ => n.to_sql(ty, out),
            },
            Value::Decimal(d) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => integer_to_sql(i64::try_from(*d)?, ty, out),
                Type::FLOAT8 => d.to_string().parse::<f64>()?.to_sql(ty, out),
                _ => d.to_sql(ty, out),
            },
            Value::String(s) => text_to_sql(s, ty, out),
            Value::Bytes(b) => b.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
            Value::DateTime(dt) => dt.to_sql(ty, out),
            Value::DateTimeTz(dt) => dt.to_sql(ty, out),
            Value::Uuid(u) => match *ty {
                Type::UUID => u.to_sql(ty, out),
                _ => text_to_sql(&u.hyphenated().to_string(), ty, out),
            },
            Value::Json(j) => j.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn get_opt<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn pg_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    let value = match *ty {
        Type::BOOL => get_opt::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get_opt::<i16>(row, idx).map(Value::Int16),
        Type::INT4 => get_opt::<i32>(row, idx).map(Value::Int32),
        Type::INT8 => get_opt::<i64>(row, idx).map(Value::Int64),
        Type::FLOAT4 => get_opt::<f32>(row, idx).map(|f| Value::Float64(f64::from(f))),
        Type::FLOAT8 => get_opt::<f64>(row, idx).map(Value::Float64),
        Type::NUMERIC => get_opt::<rust_decimal::Decimal>(row, idx).map(Value::Decimal),
        Type::BYTEA => get_opt::<Vec<u8>>(row, idx).map(Value::Bytes),
        Type::DATE => get_opt::<chrono::NaiveDate>(row, idx).map(Value::Date),
        Type::TIME => get_opt::<chrono::NaiveTime>(row, idx).map(Value::Time),
        Type::TIMESTAMP => get_opt::<chrono::NaiveDateTime>(row, idx).map(Value::DateTime),
        Type::TIMESTAMPTZ => {
            get_opt::<chrono::DateTime<chrono::Utc>>(row, idx).map(Value::DateTimeTz)
        }
        Type::UUID => get_opt::<uuid::Uuid>(row, idx).map(Value::Uuid),
        Type::JSON | Type::JSONB => get_opt::<serde_json::Value>(row, idx).map(Value::Json),
        _ => get_opt::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn pg_row(row: &tokio_postgres::Row) -> Row {
    let columns = row.columns();
    let names = columns.iter().map(|c| c.name().to_string()).collect();
    let values = columns
        .iter()
        .enumerate()
        .map(|(idx, c)| pg_value(row, idx, c.type_()))
        .collect();
    Row::new(names, values)
}

async fn run_query(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let wrapped: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = wrapped.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
    let rows = client
        .query(sql, &refs)
        .await
        .map_err(|e| map_pg_error(e, sql))?;
    Ok(rows.iter().map(pg_row).collect())
}

async fn run_execute(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<u64> {
    let wrapped: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = wrapped.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
    client
        .execute(sql, &refs)
        .await
        .map_err(|e| map_pg_error(e, sql))
}

/// PostgreSQL-family connection
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;
        Ok(Box::new(PgTransaction {
            client: self.client.clone(),
        }))
    }

    async fn is_valid(&self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }
}

/// Transaction on a [`PgConnection`]
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
}

impl PgTransaction {
    async fn finish(&self, command: &str) -> Result<()> {
        self.client
            .batch_execute(command)
            .await
            .map_err(|e| Error::Transaction {
                message: format!("{command} failed: {e}"),
                source: Some(Box::new(e)),
            })
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

/// Connection factory for PostgreSQL and openGauss
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    database_type: DatabaseType,
}

impl Default for PgConnectionFactory {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::PostgreSQL,
        }
    }
}

impl PgConnectionFactory {
    /// Factory for openGauss servers
    pub fn opengauss() -> Self {
        Self {
            database_type: DatabaseType::OpenGauss,
        }
    }
}

/// Rewrite `opengauss://` to the scheme the driver understands
fn driver_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("opengauss") => {
            format!("postgres://{rest}")
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config = tokio_postgres::Config::from_str(&driver_url(&config.url))
            .map_err(|e| Error::config(format!("invalid PostgreSQL URL: {e}")))?;
        pg_config.connect_timeout(std::time::Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }
        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        let conn = PgConnection::new(client);
        if config.query_timeout_ms > 0 {
            conn.client
                .batch_execute(&format!("SET statement_timeout = {}", config.query_timeout_ms))
                .await
                .map_err(|e| map_pg_error(e, "SET statement_timeout"))?;
        }
        Ok(Box::new(conn))
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: Value, ty: &Type) -> std::result::Result<(IsNull, Vec<u8>), BoxError> {
        let mut buf = BytesMut::new();
        let is_null = PgParam(&value).to_sql(ty, &mut buf)?;
        Ok((is_null, buf.to_vec()))
    }

    #[test]
    fn test_integer_narrows_to_column_type() {
        let (_, bytes) = encode(Value::Int64(7), &Type::INT4).unwrap();
        assert_eq!(bytes, 7i32.to_be_bytes().to_vec());
        assert!(encode(Value::Int64(i64::MAX), &Type::INT4).is_err());
    }

    #[test]
    fn test_null_accepts_any_type() {
        let (is_null, _) = encode(Value::Null, &Type::UUID).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[test]
    fn test_text_converts_to_typed_columns() {
        let (_, bytes) = encode(Value::from("42"), &Type::INT8).unwrap();
        assert_eq!(bytes, 42i64.to_be_bytes().to_vec());
        assert!(encode(Value::from("not-a-uuid"), &Type::UUID).is_err());
    }

    #[test]
    fn test_driver_url() {
        assert_eq!(driver_url("opengauss://u@h:5432/db"), "postgres://u@h:5432/db");
        assert_eq!(driver_url("postgres://u@h/db"), "postgres://u@h/db");
    }
}
