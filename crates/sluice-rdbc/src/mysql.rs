//! MySQL backend over mysql_async

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

fn map_mysql_error(e: mysql_async::Error, sql: &str) -> Error {
    match e {
        mysql_async::Error::Server(server) => {
            let mut mapped = Error::from_sql_state(&server.state, server.message);
            if let Error::Query { sql: stmt, .. } = &mut mapped {
                *stmt = Some(sql.to_string());
            }
            mapped
        }
        mysql_async::Error::Io(io) => Error::connection_with_source("I/O error", io),
        mysql_async::Error::Driver(driver) => {
            Error::connection(format!("driver error: {driver}"))
        }
        other => Error::query_with_sql(other.to_string(), sql),
    }
}

fn to_mysql(value: &Value) -> mysql_async::Value {
    use chrono::{Datelike, Timelike};
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.as_str()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
        Value::DateTime(dt) => mysql_async::Value::Date(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.nanosecond() / 1_000,
        ),
        Value::DateTimeTz(dt) => to_mysql(&Value::DateTime(dt.naive_utc())),
        Value::Uuid(u) => mysql_async::Value::from(u.hyphenated().to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

fn from_mysql(value: &mysql_async::Value) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Bytes(b.clone()),
        },
        mysql_async::Value::Int(n) => Value::Int64(*n),
        mysql_async::Value::UInt(n) => match i64::try_from(*n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::Decimal(rust_decimal::Decimal::from(*n)),
        },
        mysql_async::Value::Float(f) => Value::Float64(f64::from(*f)),
        mysql_async::Value::Double(d) => Value::Float64(*d),
        mysql_async::Value::Date(y, m, d, h, mi, s, us) => {
            let date = chrono::NaiveDate::from_ymd_opt(i32::from(*y), u32::from(*m), u32::from(*d));
            let time = chrono::NaiveTime::from_hms_micro_opt(
                u32::from(*h),
                u32::from(*mi),
                u32::from(*s),
                *us,
            );
            match (date, time) {
                (Some(date), _) if (*h, *mi, *s, *us) == (0, 0, 0, 0) => Value::Date(date),
                (Some(date), Some(time)) => Value::DateTime(chrono::NaiveDateTime::new(date, time)),
                _ => Value::Null,
            }
        }
        mysql_async::Value::Time(_neg, _days, h, m, s, us) => {
            chrono::NaiveTime::from_hms_micro_opt(u32::from(*h), u32::from(*m), u32::from(*s), *us)
                .map_or(Value::Null, Value::Time)
        }
    }
}

fn mysql_row(row: &mysql_async::Row) -> Row {
    let columns = row.columns_ref();
    let names = columns.iter().map(|c| c.name_str().to_string()).collect();
    let values = (0..columns.len())
        .map(|i| row.as_ref(i).map_or(Value::Null, from_mysql))
        .collect();
    Row::new(names, values)
}

async fn run_query(conn: &Mutex<Conn>, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut conn = conn.lock().await;
    let result: std::result::Result<Vec<mysql_async::Row>, mysql_async::Error> =
        if params.is_empty() {
            conn.query(sql).await
        } else {
            let params: Vec<mysql_async::Value> = params.iter().map(to_mysql).collect();
            conn.exec(sql, params).await
        };
    let rows = result.map_err(|e| map_mysql_error(e, sql))?;
    Ok(rows.iter().map(mysql_row).collect())
}

async fn run_execute(conn: &Mutex<Conn>, sql: &str, params: &[Value]) -> Result<u64> {
    let mut conn = conn.lock().await;
    let result = if params.is_empty() {
        conn.query_drop(sql).await
    } else {
        let params: Vec<mysql_async::Value> = params.iter().map(to_mysql).collect();
        conn.exec_drop(sql, params).await
    };
    result.map_err(|e| map_mysql_error(e, sql))?;
    Ok(conn.affected_rows())
}

/// MySQL connection
pub struct MySqlConnection {
    conn: Arc<Mutex<Conn>>,
}

impl MySqlConnection {
    /// Wrap an open connection
    pub fn new(conn: Conn) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.conn, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.conn, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        run_execute(&self.conn, "START TRANSACTION", &[]).await?;
        Ok(Box::new(MySqlTransaction {
            conn: self.conn.clone(),
        }))
    }

    async fn is_valid(&self) -> bool {
        self.conn.lock().await.ping().await.is_ok()
    }
}

/// Transaction on a [`MySqlConnection`]
pub struct MySqlTransaction {
    conn: Arc<Mutex<Conn>>,
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.conn, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.conn, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        run_execute(&self.conn, "COMMIT", &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::transaction(format!("COMMIT failed: {e}")))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        run_execute(&self.conn, "ROLLBACK", &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::transaction(format!("ROLLBACK failed: {e}")))
    }
}

/// Connection factory for MySQL
#[derive(Debug, Clone, Default)]
pub struct MySqlConnectionFactory;

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let opts = Opts::from_url(&config.url)
            .map_err(|e| Error::config(format!("invalid MySQL URL: {e}")))?;
        let connect = Conn::new(opts);
        let conn = tokio::time::timeout(
            std::time::Duration::from_millis(config.connect_timeout_ms),
            connect,
        )
        .await
        .map_err(|_| Error::timeout("MySQL connect timed out"))?
        .map_err(|e| map_mysql_error(e, "connect"))?;
        Ok(Box::new(MySqlConnection::new(conn)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion_round_trips_dates() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(from_mysql(&to_mysql(&Value::Date(date))), Value::Date(date));

        let dt = date.and_hms_micro_opt(13, 5, 9, 250).unwrap();
        assert_eq!(from_mysql(&to_mysql(&Value::DateTime(dt))), Value::DateTime(dt));
    }

    #[test]
    fn test_text_protocol_values_decode_as_strings() {
        assert_eq!(
            from_mysql(&mysql_async::Value::Bytes(b"ROW".to_vec())),
            Value::from("ROW")
        );
        assert_eq!(
            from_mysql(&mysql_async::Value::UInt(u64::MAX)),
            Value::Decimal(rust_decimal::Decimal::from(u64::MAX))
        );
    }
}
