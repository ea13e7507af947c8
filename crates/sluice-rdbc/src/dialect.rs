//! SQL dialects
//!
//! Statements are built with sea-query and rendered by the backend's query
//! builder. Every value travels as a bound parameter; the dialect decides the
//! placeholder syntax (`$n` or `?`) and collects parameters in render order.

use sea_query::{
    Alias, Asterisk, DeleteStatement, Expr, InsertStatement, IntoIden, MysqlQueryBuilder,
    OnConflict, Order, PostgresQueryBuilder, Query, SelectStatement, SimpleExpr, TableRef,
    UpdateStatement,
};

use crate::connection::DatabaseType;
use crate::error::{Error, Result};
use crate::store::ScanRequest;
use crate::types::{Row, TableName, Value};

/// A rendered statement with its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with placeholders
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<Value>,
}

fn table_ref(table: &TableName) -> TableRef {
    match &table.schema {
        Some(s) => TableRef::SchemaTable(
            Alias::new(s.as_str()).into_iden(),
            Alias::new(table.name.as_str()).into_iden(),
        ),
        None => TableRef::Table(Alias::new(table.name.as_str()).into_iden()),
    }
}

/// Collects parameters and hands out placeholders in bind order
struct Binder<'a, D: SqlDialect + ?Sized> {
    dialect: &'a D,
    params: Vec<Value>,
}

impl<'a, D: SqlDialect + ?Sized> Binder<'a, D> {
    fn new(dialect: &'a D) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> SimpleExpr {
        self.params.push(value);
        Expr::cust(self.dialect.placeholder(self.params.len()))
    }

    /// `col = ?` for values, `col IS NULL` for NULLs
    fn matches(&mut self, column: &str, value: &Value) -> SimpleExpr {
        if value.is_null() {
            Expr::col(Alias::new(column)).is_null()
        } else {
            Expr::col(Alias::new(column)).eq(self.bind(value.clone()))
        }
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

/// Vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier
    fn quote_identifier(&self, name: &str) -> String;

    /// Placeholder for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String;

    /// Render a SELECT
    fn render_select(&self, stmt: &SelectStatement) -> String;

    /// Render an INSERT
    fn render_insert(&self, stmt: &InsertStatement) -> String;

    /// Render an UPDATE
    fn render_update(&self, stmt: &UpdateStatement) -> String;

    /// Render a DELETE
    fn render_delete(&self, stmt: &DeleteStatement) -> String;

    /// Column catalog query returning `column_name`, `data_type`,
    /// `nullable`, `ordinal_position` and `pk_ordinal`
    fn list_columns(&self, table: &TableName) -> Statement;

    /// Insert a row, replacing non-key columns when the key already exists
    fn upsert(&self, table: &TableName, row: &Row, key_columns: &[String]) -> Result<Statement>;

    /// Suffix a dialect needs for a FROM-less `SELECT ... WHERE`
    fn dual(&self) -> &'static str {
        ""
    }

    /// Fully qualified, quoted table name
    fn qualified_name(&self, table: &TableName) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    /// `MIN`, `MAX` and `COUNT(*)` of a key column in one probe
    fn key_bounds(&self, table: &TableName, key_column: &str) -> Statement {
        let key = self.quote_identifier(key_column);
        let mut stmt = Query::select();
        stmt.from(table_ref(table))
            .expr_as(Expr::cust(format!("MIN({key})")), Alias::new("min_key"))
            .expr_as(Expr::cust(format!("MAX({key})")), Alias::new("max_key"))
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("row_count"));
        Statement {
            sql: self.render_select(&stmt),
            params: Vec::new(),
        }
    }

    /// Row count of a table
    fn count(&self, table: &TableName) -> Statement {
        let mut stmt = Query::select();
        stmt.from(table_ref(table))
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("row_count"));
        Statement {
            sql: self.render_select(&stmt),
            params: Vec::new(),
        }
    }

    /// One page of a table scan
    fn scan(&self, table: &TableName, request: &ScanRequest) -> Statement {
        let mut binder = Binder::new(self);
        let mut stmt = Query::select();
        stmt.column(Asterisk).from(table_ref(table));
        match request {
            ScanRequest::Keyed {
                key_column,
                range,
                after,
                limit,
            } => {
                if let Some(lower) = &range.lower {
                    stmt.and_where(Expr::col(Alias::new(key_column)).gte(binder.bind(lower.clone())));
                }
                if let Some(upper) = &range.upper {
                    stmt.and_where(Expr::col(Alias::new(key_column)).lt(binder.bind(upper.clone())));
                }
                if let Some(cursor) = after {
                    stmt.and_where(Expr::col(Alias::new(key_column)).gt(binder.bind(cursor.clone())));
                }
                stmt.order_by(Alias::new(key_column), Order::Asc)
                    .limit(*limit as u64);
            }
            ScanRequest::Paged {
                order_by,
                offset,
                limit,
            } => {
                for column in order_by {
                    stmt.order_by(Alias::new(column), Order::Asc);
                }
                stmt.limit(*limit as u64).offset(*offset);
            }
        }
        let sql = self.render_select(&stmt);
        binder.finish(sql)
    }

    /// Insert a row unless an identical row already exists
    fn insert_if_absent(&self, table: &TableName, row: &Row) -> Statement {
        let mut binder = Binder::new(self);
        let columns: Vec<String> = row
            .columns()
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect();
        let values: Vec<String> = row
            .values()
            .iter()
            .map(|v| {
                binder.params.push(v.clone());
                self.placeholder(binder.params.len())
            })
            .collect();
        let conditions: Vec<String> = row
            .iter()
            .map(|(c, v)| {
                let column = self.quote_identifier(c);
                if v.is_null() {
                    format!("{column} IS NULL")
                } else {
                    binder.params.push(v.clone());
                    format!("{column} = {}", self.placeholder(binder.params.len()))
                }
            })
            .collect();
        let qualified = self.qualified_name(table);
        let sql = format!(
            "INSERT INTO {qualified} ({}) SELECT {}{} WHERE NOT EXISTS (SELECT 1 FROM {qualified} WHERE {})",
            columns.join(", "),
            values.join(", "),
            self.dual(),
            conditions.join(" AND ")
        );
        binder.finish(sql)
    }

    /// Overwrite the rows matching every column of `before` with `after`
    fn update_matching(&self, table: &TableName, before: &Row, after: &Row) -> Statement {
        let mut binder = Binder::new(self);
        let mut stmt = Query::update();
        stmt.table(table_ref(table));
        for (column, value) in after.iter() {
            let expr = binder.bind(value.clone());
            stmt.value(Alias::new(column), expr);
        }
        for (column, value) in before.iter() {
            let cond = binder.matches(column, value);
            stmt.and_where(cond);
        }
        let sql = self.render_update(&stmt);
        binder.finish(sql)
    }

    /// Delete the rows matching every column of `filter`
    fn delete_matching(&self, table: &TableName, filter: &Row) -> Statement {
        let mut binder = Binder::new(self);
        let mut stmt = Query::delete();
        stmt.from_table(table_ref(table));
        for (column, value) in filter.iter() {
            let cond = binder.matches(column, value);
            stmt.and_where(cond);
        }
        let sql = self.render_delete(&stmt);
        binder.finish(sql)
    }

    /// Delete every row of a table
    fn delete_all(&self, table: &TableName) -> Statement {
        let mut stmt = Query::delete();
        stmt.from_table(table_ref(table));
        Statement {
            sql: self.render_delete(&stmt),
            params: Vec::new(),
        }
    }
}

fn insert_statement<D: SqlDialect + ?Sized>(
    dialect: &D,
    table: &TableName,
    row: &Row,
) -> Result<(InsertStatement, Vec<Value>)> {
    let mut binder = Binder::new(dialect);
    let columns: Vec<_> = row
        .columns()
        .iter()
        .map(|c| Alias::new(c.as_str()).into_iden())
        .collect();
    let values: Vec<SimpleExpr> = row.values().iter().map(|v| binder.bind(v.clone())).collect();
    let mut stmt = Query::insert();
    stmt.into_table(table_ref(table))
        .columns(columns)
        .values(values)
        .map_err(|e| Error::internal(format!("invalid insert for {table}: {e}")))?;
    Ok((stmt, binder.params))
}

fn update_columns(row: &Row, key_columns: &[String]) -> Vec<sea_query::DynIden> {
    row.columns()
        .iter()
        .filter(|c| !key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
        .map(|c| Alias::new(c.as_str()).into_iden())
        .collect()
}

/// PostgreSQL and openGauss dialect
#[derive(Debug, Clone)]
pub struct PostgresDialect {
    name: &'static str,
}

impl Default for PostgresDialect {
    fn default() -> Self {
        Self { name: "PostgreSQL" }
    }
}

impl PostgresDialect {
    /// Dialect for openGauss servers
    pub fn opengauss() -> Self {
        Self { name: "openGauss" }
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        self.name
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn render_select(&self, stmt: &SelectStatement) -> String {
        stmt.to_string(PostgresQueryBuilder)
    }

    fn render_insert(&self, stmt: &InsertStatement) -> String {
        stmt.to_string(PostgresQueryBuilder)
    }

    fn render_update(&self, stmt: &UpdateStatement) -> String {
        stmt.to_string(PostgresQueryBuilder)
    }

    fn render_delete(&self, stmt: &DeleteStatement) -> String {
        stmt.to_string(PostgresQueryBuilder)
    }

    fn list_columns(&self, table: &TableName) -> Statement {
        let sql = r#"SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                (c.is_nullable = 'YES') AS nullable,
                c.ordinal_position::int4 AS ordinal_position,
                pk.ordinal_position::int4 AS pk_ordinal
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = $1
                    AND tc.table_name = $2
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position"#;
        Statement {
            sql: sql.to_string(),
            params: vec![
                Value::from(table.schema.as_deref().unwrap_or("public")),
                Value::from(table.name.as_str()),
            ],
        }
    }

    fn upsert(&self, table: &TableName, row: &Row, key_columns: &[String]) -> Result<Statement> {
        let (mut stmt, params) = insert_statement(self, table, row)?;
        let keys: Vec<_> = key_columns
            .iter()
            .map(|c| Alias::new(c.as_str()).into_iden())
            .collect();
        let updates = update_columns(row, key_columns);
        let mut on_conflict = OnConflict::columns(keys);
        if updates.is_empty() {
            on_conflict.do_nothing();
        } else {
            on_conflict.update_columns(updates);
        }
        stmt.on_conflict(on_conflict.to_owned());
        Ok(Statement {
            sql: self.render_insert(&stmt),
            params,
        })
    }
}

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn dual(&self) -> &'static str {
        " FROM DUAL"
    }

    fn render_select(&self, stmt: &SelectStatement) -> String {
        stmt.to_string(MysqlQueryBuilder)
    }

    fn render_insert(&self, stmt: &InsertStatement) -> String {
        stmt.to_string(MysqlQueryBuilder)
    }

    fn render_update(&self, stmt: &UpdateStatement) -> String {
        stmt.to_string(MysqlQueryBuilder)
    }

    fn render_delete(&self, stmt: &DeleteStatement) -> String {
        stmt.to_string(MysqlQueryBuilder)
    }

    fn list_columns(&self, table: &TableName) -> Statement {
        let schema_filter = if table.schema.is_some() {
            "c.TABLE_SCHEMA = ?"
        } else {
            "c.TABLE_SCHEMA = DATABASE()"
        };
        let sql = format!(
            r#"SELECT
                c.COLUMN_NAME AS column_name,
                c.DATA_TYPE AS data_type,
                (c.IS_NULLABLE = 'YES') AS nullable,
                c.ORDINAL_POSITION AS ordinal_position,
                k.ORDINAL_POSITION AS pk_ordinal
            FROM information_schema.COLUMNS c
            LEFT JOIN information_schema.KEY_COLUMN_USAGE k
                ON k.TABLE_SCHEMA = c.TABLE_SCHEMA
                AND k.TABLE_NAME = c.TABLE_NAME
                AND k.COLUMN_NAME = c.COLUMN_NAME
                AND k.CONSTRAINT_NAME = 'PRIMARY'
            WHERE {schema_filter} AND c.TABLE_NAME = ?
            ORDER BY c.ORDINAL_POSITION"#
        );
        let mut params = Vec::with_capacity(2);
        if let Some(schema) = &table.schema {
            params.push(Value::from(schema.as_str()));
        }
        params.push(Value::from(table.name.as_str()));
        Statement { sql, params }
    }

    fn upsert(&self, table: &TableName, row: &Row, key_columns: &[String]) -> Result<Statement> {
        let (mut stmt, params) = insert_statement(self, table, row)?;
        let mut updates = update_columns(row, key_columns);
        if updates.is_empty() {
            // ON DUPLICATE KEY needs at least one assignment; rewriting a key
            // column with its own value leaves the row unchanged.
            updates = key_columns
                .iter()
                .take(1)
                .map(|c| Alias::new(c.as_str()).into_iden())
                .collect();
        }
        let mut on_conflict = OnConflict::new();
        on_conflict.update_columns(updates);
        stmt.on_conflict(on_conflict.to_owned());
        Ok(Statement {
            sql: self.render_insert(&stmt),
            params,
        })
    }
}

/// Dialect for a database product
pub fn dialect_for(database_type: DatabaseType) -> Box<dyn SqlDialect> {
    match database_type {
        DatabaseType::PostgreSQL => Box::new(PostgresDialect::default()),
        DatabaseType::OpenGauss => Box::new(PostgresDialect::opengauss()),
        DatabaseType::MySQL => Box::new(MySqlDialect),
    }
}
