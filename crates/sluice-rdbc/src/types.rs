//! Value, row and table metadata types
//!
//! [`Value`] covers the column types a migration moves between the
//! PostgreSQL and MySQL families. Values carry a total order
//! ([`Value::total_cmp`]) that works across integer widths, so key ranges
//! compare the same way regardless of which backend produced the bound.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// SQL value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeTz(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// SQL type family name of the value
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float64(_) => "DOUBLE",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BINARY",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "TIMESTAMP",
            Self::DateTimeTz(_) => "TIMESTAMPTZ",
            Self::Uuid(_) => "UUID",
            Self::Json(_) => "JSON",
        }
    }

    /// Whether the value is one of the integer variants
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int16(_) | Self::Int32(_) | Self::Int64(_))
    }

    /// Try to read the value as a bool.
    ///
    /// Accepts the textual forms catalogs use for flags (`t`, `true`, `1`).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "y" | "yes" | "on" => Some(true),
                "f" | "false" | "0" | "n" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to read the value as an i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Decimal(d) if d.fract().is_zero() => i64::try_from(*d).ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to read the value as an f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            _ => None,
        }
    }

    /// Borrow the value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value as text, `None` for NULL
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            other => Some(other.canonical_text()),
        }
    }

    /// Rank of the value's comparison family
    fn family(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int16(_)
            | Self::Int32(_)
            | Self::Int64(_)
            | Self::Float64(_)
            | Self::Decimal(_) => 2,
            Self::String(_) => 3,
            Self::Bytes(_) => 4,
            Self::Date(_) => 5,
            Self::Time(_) => 6,
            Self::DateTime(_) => 7,
            Self::DateTimeTz(_) => 8,
            Self::Uuid(_) => 9,
            Self::Json(_) => 10,
        }
    }

    /// Total order over values.
    ///
    /// NULL sorts first. Numbers compare by magnitude across variants; values
    /// of unrelated families order by family.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        let (fa, fb) = (self.family(), other.family());
        if fa != fb {
            return fa.cmp(&fb);
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (Self::DateTimeTz(a), Self::DateTimeTz(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Json(a), Self::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) => compare_numbers(a, b),
        }
    }

    /// Stable textual form used for hashing and digests.
    ///
    /// All integer widths render identically, decimals are normalized and
    /// binary data is hex encoded.
    pub fn canonical_text(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int16(n) => n.to_string(),
            Self::Int32(n) => n.to_string(),
            Self::Int64(n) => n.to_string(),
            Self::Float64(n) => n.to_string(),
            Self::Decimal(d) => d.normalize().to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Self::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Self::DateTimeTz(dt) => dt.to_rfc3339(),
            Self::Uuid(u) => u.hyphenated().to_string(),
            Self::Json(j) => j.to_string(),
        }
    }

    /// Canonical bytes with a family tag, so `1` and `'1'` differ
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let tag = match self {
            Self::Null => b'n',
            Self::Bool(_) => b'b',
            Self::Int16(_) | Self::Int32(_) | Self::Int64(_) => b'i',
            Self::Float64(_) => b'f',
            Self::Decimal(d) if d.fract().is_zero() => b'i',
            Self::Decimal(_) => b'd',
            Self::String(_) => b's',
            Self::Bytes(_) => b'x',
            Self::Date(_) => b'D',
            Self::Time(_) => b'T',
            Self::DateTime(_) => b'S',
            Self::DateTimeTz(_) => b'Z',
            Self::Uuid(_) => b'u',
            Self::Json(_) => b'j',
        };
        let text = self.canonical_text();
        let mut out = Vec::with_capacity(text.len() + 9);
        out.push(tag);
        out.extend_from_slice(&(text.len() as u64).to_be_bytes());
        out.extend_from_slice(text.as_bytes());
        out
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (exact_integer(a), exact_integer(b)) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (as_decimal(a), as_decimal(b)) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.total_cmp(&y)
}

fn exact_integer(v: &Value) -> Option<i128> {
    match v {
        Value::Int16(n) => Some(i128::from(*n)),
        Value::Int32(n) => Some(i128::from(*n)),
        Value::Int64(n) => Some(i128::from(*n)),
        _ => None,
    }
}

fn as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Int16(n) => Some(Decimal::from(*n)),
        Value::Int32(n) => Some(Decimal::from(*n)),
        Value::Int64(n) => Some(Decimal::from(*n)),
        Value::Decimal(d) => Some(*d),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "'{s}'"),
            other => f.write_str(&other.canonical_text()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A database row: ordered column names with their values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from parallel column and value vectors
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<I, C, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, V)>,
        C: Into<String>,
        V: Into<Value>,
    {
        let (columns, values) = pairs
            .into_iter()
            .map(|(c, v)| (c.into(), v.into()))
            .unzip();
        Self { columns, values }
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a column index
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value of a named column (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Set a column, replacing an existing value or appending a new column
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter().position(|c| *c == name) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.columns.push(name);
                self.values.push(value);
            }
        }
    }

    /// Values of the given columns, in the order requested.
    ///
    /// Returns `None` if any column is missing.
    pub fn project(&self, columns: &[String]) -> Option<Vec<Value>> {
        columns
            .iter()
            .map(|c| self.get_by_name(c).cloned())
            .collect()
    }

    /// Sub-row with only the given columns
    pub fn select(&self, columns: &[String]) -> Option<Row> {
        let values = self.project(columns)?;
        Some(Row::new(columns.to_vec(), values))
    }

    /// Iterate `(column, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Whether every column of `other` has an equal value in this row
    pub fn matches(&self, other: &Row) -> bool {
        other.iter().all(|(col, value)| {
            self.get_by_name(col)
                .is_some_and(|v| v.total_cmp(value) == Ordering::Equal)
        })
    }
}

/// Possibly schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    /// Schema (PostgreSQL) or database (MySQL) qualifier
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl TableName {
    /// Create an unqualified table name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Create a schema-qualified table name
    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

impl FromStr for TableName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(*name)),
            [schema, name] if !schema.is_empty() && !name.is_empty() => {
                Ok(Self::qualified(*schema, *name))
            }
            _ => Err(crate::Error::config(format!("invalid table name: '{s}'"))),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        s.parse()
    }
}

impl From<TableName> for String {
    fn from(t: TableName) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Database type name
    pub type_name: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// 1-based position in the table
    pub ordinal: u32,
    /// 1-based position in the primary key, if part of it
    pub primary_key_ordinal: Option<u32>,
}

impl ColumnMetadata {
    /// Create a nullable, non-key column
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            ordinal: 0,
            primary_key_ordinal: None,
        }
    }

    /// Mark the column as the `ordinal`-th primary key column
    pub fn primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Whether this column is part of the primary key
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }

    /// Whether the declared type is an integer type
    pub fn is_integer_type(&self) -> bool {
        matches!(
            self.type_name.to_ascii_lowercase().as_str(),
            "smallint"
                | "integer"
                | "int"
                | "int2"
                | "int4"
                | "int8"
                | "bigint"
                | "tinyint"
                | "mediumint"
                | "serial"
                | "bigserial"
        )
    }
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Table name
    pub name: TableName,
    /// Columns in table order
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// Create table metadata, assigning ordinals in the given order
    pub fn new(name: TableName, columns: Vec<ColumnMetadata>) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(idx, mut c)| {
                if c.ordinal == 0 {
                    c.ordinal = idx as u32 + 1;
                }
                c
            })
            .collect();
        Self { name, columns }
    }

    /// Find a column by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Primary key columns in key order
    pub fn primary_key_columns(&self) -> Vec<&ColumnMetadata> {
        let mut pk: Vec<_> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        pk.sort_by_key(|c| c.primary_key_ordinal);
        pk
    }

    /// Primary key column names in key order
    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// All column names in table order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Half-open key range `[lower, upper)`; `None` means unbounded
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub lower: Option<Value>,
    /// Exclusive upper bound
    pub upper: Option<Value>,
}

impl KeyRange {
    /// Range covering the whole key domain
    pub fn full() -> Self {
        Self::default()
    }

    /// Range with the given bounds
    pub fn new(lower: Option<Value>, upper: Option<Value>) -> Self {
        Self { lower, upper }
    }

    /// Whether `key` falls inside the range
    pub fn contains(&self, key: &Value) -> bool {
        let above = self
            .lower
            .as_ref()
            .is_none_or(|lo| key.total_cmp(lo) != Ordering::Less);
        let below = self
            .upper
            .as_ref()
            .is_none_or(|hi| key.total_cmp(hi) == Ordering::Less);
        above && below
    }

    /// Whether both ends are unbounded
    pub fn is_full(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = self
            .lower
            .as_ref()
            .map_or_else(|| "-inf".to_string(), ToString::to_string);
        let hi = self
            .upper
            .as_ref()
            .map_or_else(|| "+inf".to_string(), ToString::to_string);
        write!(f, "[{lo}, {hi})")
    }
}

/// Result of a bounds-probing query on a key column
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyBounds {
    /// Smallest key, `None` for an empty table
    pub min: Option<Value>,
    /// Largest key, `None` for an empty table
    pub max: Option<Value>,
    /// Row count
    pub row_count: u64,
}
