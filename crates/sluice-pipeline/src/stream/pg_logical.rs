//! Logical replication slot reader for PostgreSQL and openGauss
//!
//! Changes are peeked from a slot using the `test_decoding` output plugin
//! and decoded from its text format:
//!
//! ```text
//! BEGIN 529
//! table public.t_order: INSERT: order_id[bigint]:1 status[text]:'new'
//! table public.t_order: UPDATE: old-key: order_id[bigint]:1 new-tuple: order_id[bigint]:2 status[text]:'paid'
//! table public.t_order: DELETE: order_id[bigint]:2
//! COMMIT 529
//! ```
//!
//! Every change of a transaction takes the transaction's commit LSN as its
//! position, so positions follow commit order. Peeking does not consume; the
//! slot is advanced only on [`ChangeStreamReader::acknowledge`], and only
//! past transactions that are entirely below the acknowledged position.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sluice_rdbc::connection::DatabaseType;
use sluice_rdbc::store::TableStore;
use sluice_rdbc::{Row, TableName, Value};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ChangeStreamReader, EventStream};
use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, ChangeOp};
use crate::position::{parse_lsn, Position};

const PEEK_SQL: &str =
    "SELECT lsn::text AS lsn, xid::text AS xid, data FROM pg_logical_slot_peek_changes($1, NULL, $2)";
const SLOT_EXISTS_SQL: &str = "SELECT slot_name::text AS slot_name FROM pg_replication_slots WHERE slot_name = $1";
const CREATE_SLOT_SQL: &str =
    "SELECT slot_name::text AS slot_name, lsn::text AS lsn FROM pg_create_logical_replication_slot($1, 'test_decoding')";
const CREATE_SLOT_SQL_OPENGAUSS: &str =
    "SELECT slotname::text AS slot_name, xlog_position::text AS lsn FROM pg_create_logical_replication_slot($1, 'test_decoding')";
const ADVANCE_SQL: &str = "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)";

fn default_max_changes() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_create_slot() -> bool {
    true
}

/// Slot reader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgLogicalConfig {
    /// Replication slot name
    pub slot: String,
    /// Changes requested per poll
    #[serde(default = "default_max_changes")]
    pub max_changes: usize,
    /// Sleep between polls that return nothing new
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Create the slot when it does not exist
    #[serde(default = "default_create_slot")]
    pub create_slot: bool,
}

impl PgLogicalConfig {
    /// Settings for `slot` with defaults
    pub fn new(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            max_changes: default_max_changes(),
            poll_interval_ms: default_poll_interval_ms(),
            create_slot: default_create_slot(),
        }
    }
}

/// One decoded `test_decoding` output line
#[derive(Debug, Clone, PartialEq)]
pub enum TestDecodingLine {
    /// Transaction start
    Begin {
        /// Transaction id
        xid: u64,
    },
    /// Transaction end
    Commit {
        /// Transaction id
        xid: u64,
    },
    /// Row change
    Change {
        /// Table
        table: TableName,
        /// Change kind
        op: ChangeOp,
        /// Old key (update with key change or replica identity full, delete)
        old: Option<Row>,
        /// New tuple (insert, update)
        new: Option<Row>,
    },
}

/// Parse one line of `test_decoding` output
pub fn parse_test_decoding(data: &str) -> Result<TestDecodingLine> {
    let data = data.trim();
    if let Some(xid) = data.strip_prefix("BEGIN") {
        return Ok(TestDecodingLine::Begin { xid: parse_xid(xid) });
    }
    if let Some(xid) = data.strip_prefix("COMMIT") {
        return Ok(TestDecodingLine::Commit { xid: parse_xid(xid) });
    }
    let rest = data
        .strip_prefix("table ")
        .ok_or_else(|| decode_error(data, "unknown line"))?;
    let (table, rest) = split_table_name(rest).ok_or_else(|| decode_error(data, "missing table"))?;
    let table = table
        .replace('"', "")
        .parse::<TableName>()
        .map_err(|e| decode_error(data, &e.to_string()))?;
    let rest = rest.trim_start();
    let (op, body) = if let Some(body) = rest.strip_prefix("INSERT:") {
        (ChangeOp::Insert, body)
    } else if let Some(body) = rest.strip_prefix("UPDATE:") {
        (ChangeOp::Update, body)
    } else if let Some(body) = rest.strip_prefix("DELETE:") {
        (ChangeOp::Delete, body)
    } else {
        return Err(decode_error(data, "unknown change kind"));
    };
    let body = body.trim();
    if body.starts_with("(no-tuple data)") {
        return Ok(TestDecodingLine::Change {
            table,
            op,
            old: None,
            new: None,
        });
    }
    let (old, new) = match op {
        ChangeOp::Insert => (None, Some(parse_tuple(body, data)?)),
        ChangeOp::Delete => (Some(parse_tuple(body, data)?), None),
        ChangeOp::Update => match body.strip_prefix("old-key:") {
            Some(both) => {
                let (old, new) = both
                    .split_once("new-tuple:")
                    .ok_or_else(|| decode_error(data, "missing new-tuple"))?;
                (Some(parse_tuple(old, data)?), Some(parse_tuple(new, data)?))
            }
            None => (None, Some(parse_tuple(body, data)?)),
        },
    };
    Ok(TestDecodingLine::Change { table, op, old, new })
}

fn parse_xid(s: &str) -> u64 {
    s.trim().parse().unwrap_or(0)
}

fn decode_error(line: &str, what: &str) -> PipelineError {
    PipelineError::FatalApply {
        job_id: String::new(),
        position: String::new(),
        message: format!("cannot decode test_decoding output ({what}): {line}"),
    }
}

/// Split `schema.table: rest` at the colon that ends the table name
fn split_table_name(s: &str) -> Option<(&str, &str)> {
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ':' if !quoted => return Some((&s[..i], &s[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_tuple(body: &str, line: &str) -> Result<Row> {
    let mut row = Row::default();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let open = rest.find('[').ok_or_else(|| decode_error(line, "missing column type"))?;
        let name = rest[..open].trim().trim_matches('"').to_string();
        let close = rest[open..]
            .find("]:")
            .map(|i| open + i)
            .ok_or_else(|| decode_error(line, "unterminated column type"))?;
        let type_name = &rest[open + 1..close];
        let after = &rest[close + 2..];
        let (raw, quoted, remaining) = if let Some(inner) = after.strip_prefix('\'') {
            let mut value = String::new();
            let mut chars = inner.char_indices().peekable();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        value.push('\'');
                        chars.next();
                    } else {
                        end = Some(i + 1);
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            let end = end.ok_or_else(|| decode_error(line, "unterminated string"))?;
            (value, true, &inner[end..])
        } else {
            let end = after.find(' ').unwrap_or(after.len());
            (after[..end].to_string(), false, &after[end..])
        };
        if quoted || raw != "unchanged-toast-datum" {
            row.set(name, typed_value(type_name, &raw, quoted));
        }
        rest = remaining.trim_start();
    }
    Ok(row)
}

fn typed_value(type_name: &str, raw: &str, quoted: bool) -> Value {
    if !quoted && raw == "null" {
        return Value::Null;
    }
    let parsed = match type_name {
        "smallint" => raw.parse().ok().map(Value::Int16),
        "integer" => raw.parse().ok().map(Value::Int32),
        "bigint" => raw.parse().ok().map(Value::Int64),
        "numeric" => Decimal::from_str(raw).ok().map(Value::Decimal),
        "real" | "double precision" => raw.parse().ok().map(Value::Float64),
        "boolean" => match raw {
            "true" | "t" => Some(Value::Bool(true)),
            "false" | "f" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(raw.to_string()))
}

#[derive(Debug, Default)]
struct PollerState {
    /// Commit LSNs delivered and not yet passed to the slot
    delivered: VecDeque<u64>,
    /// Highest commit LSN delivered
    last_delivered: Option<u64>,
    /// WAL position at the start of the latest poll that found nothing new
    idle_since: Option<u64>,
}

/// Change stream over a logical replication slot
pub struct PgLogicalPoller {
    name: String,
    store: Arc<dyn TableStore>,
    config: PgLogicalConfig,
    state: Arc<Mutex<PollerState>>,
}

impl std::fmt::Debug for PgLogicalPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLogicalPoller")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

struct Poll {
    store: Arc<dyn TableStore>,
    config: PgLogicalConfig,
    state: Arc<Mutex<PollerState>>,
    from: Option<u64>,
    last: Option<u64>,
    limit: usize,
    buffer: VecDeque<ChangeEvent>,
    done: bool,
}

fn current_wal_sql(database_type: DatabaseType) -> &'static str {
    match database_type {
        DatabaseType::OpenGauss => "SELECT pg_current_xlog_location()::text AS lsn",
        _ => "SELECT pg_current_wal_lsn()::text AS lsn",
    }
}

async fn current_wal(store: &dyn TableStore) -> Result<u64> {
    let conn = store.connect().await.map_err(PipelineError::from_database)?;
    let row = conn
        .query_one(current_wal_sql(store.database_type()), &[])
        .await
        .map_err(PipelineError::from_database)?
        .ok_or_else(|| PipelineError::precheck("current WAL position query returned no row"))?;
    row.get(0)
        .and_then(Value::as_str)
        .and_then(parse_lsn)
        .ok_or_else(|| PipelineError::precheck("cannot parse current WAL position"))
}

impl Poll {
    /// Fetch one batch into the buffer; returns whether anything new arrived
    async fn fetch(&mut self) -> Result<bool> {
        let wal_at_start = current_wal(self.store.as_ref()).await?;
        let conn = self.store.connect().await.map_err(PipelineError::from_database)?;
        let rows = conn
            .query(
                PEEK_SQL,
                &[
                    Value::from(self.config.slot.as_str()),
                    Value::Int64(self.limit as i64),
                ],
            )
            .await
            .map_err(PipelineError::from_database)?;
        drop(conn);

        let mut pending: Vec<ChangeEvent> = Vec::new();
        let mut fresh = 0usize;
        let mut skipped = 0usize;
        for row in &rows {
            let data = row.get_by_name("data").and_then(Value::as_str).unwrap_or("");
            match parse_test_decoding(data)? {
                TestDecodingLine::Begin { .. } => pending.clear(),
                TestDecodingLine::Change { table, op, old, new } => {
                    if let Some(event) = to_event(table, op, old, new) {
                        pending.push(event);
                    } else {
                        warn!(slot = %self.config.slot, "skipping change without tuple data: {data}");
                    }
                }
                TestDecodingLine::Commit { .. } => {
                    let lsn = row
                        .get_by_name("lsn")
                        .and_then(Value::as_str)
                        .and_then(parse_lsn)
                        .ok_or_else(|| decode_error(data, "missing commit lsn"))?;
                    let wanted = self.from.is_none_or(|f| lsn >= f)
                        && self.last.is_none_or(|l| lsn > l);
                    if wanted {
                        fresh += pending.len();
                        let position = Position::Lsn(lsn);
                        self.buffer
                            .extend(pending.drain(..).map(|e| e.at(position.clone())));
                        self.last = Some(lsn);
                        let mut state = self.state.lock();
                        state.delivered.push_back(lsn);
                        state.last_delivered = Some(lsn);
                    } else {
                        skipped += pending.len();
                        pending.clear();
                    }
                }
            }
        }

        let full = rows.len() >= self.limit;
        if fresh == 0 && full {
            // The window is full of already delivered changes; widen it.
            self.limit = (self.limit * 2).min(self.config.max_changes.saturating_mul(64));
        } else if fresh > 0 {
            self.limit = self.config.max_changes;
        }
        if fresh == 0 && !full {
            self.state.lock().idle_since = Some(wal_at_start);
        }
        debug!(slot = %self.config.slot, fresh, skipped, "polled replication slot");
        Ok(fresh > 0)
    }
}

fn to_event(table: TableName, op: ChangeOp, old: Option<Row>, new: Option<Row>) -> Option<ChangeEvent> {
    let origin = Position::origin();
    match op {
        ChangeOp::Insert => Some(ChangeEvent::insert(origin, table, new?)),
        ChangeOp::Update => {
            let new = new?;
            let before = old.unwrap_or_else(|| new.clone());
            Some(ChangeEvent::update(origin, table, before, new))
        }
        ChangeOp::Delete => Some(ChangeEvent::delete(origin, table, old?)),
    }
}

impl PgLogicalPoller {
    /// Reader over `config.slot` on `store`
    pub fn new(name: impl Into<String>, store: Arc<dyn TableStore>, config: PgLogicalConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            state: Arc::new(Mutex::new(PollerState::default())),
        }
    }

    /// Whether the slot exists on the server
    pub async fn slot_exists(&self) -> Result<bool> {
        let conn = self.store.connect().await.map_err(PipelineError::from_database)?;
        let existing = conn
            .query(SLOT_EXISTS_SQL, &[Value::from(self.config.slot.as_str())])
            .await
            .map_err(PipelineError::from_database)?;
        Ok(!existing.is_empty())
    }

    /// Create the slot if it is missing.
    ///
    /// Returns the LSN a newly created slot retains changes from, or `None`
    /// when the slot already existed.
    pub async fn ensure_slot(&self) -> Result<Option<u64>> {
        if self.slot_exists().await? {
            return Ok(None);
        }
        if !self.config.create_slot {
            return Err(PipelineError::precheck(format!(
                "replication slot '{}' does not exist on {}",
                self.config.slot, self.name
            )));
        }
        let sql = match self.store.database_type() {
            DatabaseType::OpenGauss => CREATE_SLOT_SQL_OPENGAUSS,
            _ => CREATE_SLOT_SQL,
        };
        let conn = self.store.connect().await.map_err(PipelineError::from_database)?;
        let created = conn
            .query_one(sql, &[Value::from(self.config.slot.as_str())])
            .await
            .map_err(PipelineError::from_database)?;
        let lsn = created
            .as_ref()
            .and_then(|row| row.get_by_name("lsn"))
            .and_then(Value::as_str)
            .and_then(parse_lsn)
            .ok_or_else(|| {
                PipelineError::precheck(format!(
                    "creating replication slot '{}' on {} returned no start position",
                    self.config.slot, self.name
                ))
            })?;
        info!(slot = %self.config.slot, datasource = %self.name, lsn = %Position::Lsn(lsn), "created replication slot");
        Ok(Some(lsn))
    }
}

#[async_trait]
impl ChangeStreamReader for PgLogicalPoller {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, from: Option<Position>) -> Result<EventStream> {
        let from = match from {
            None => None,
            Some(Position::Lsn(lsn)) => Some(lsn),
            Some(other) => {
                return Err(PipelineError::config(format!(
                    "{} cannot start at non-LSN position {other}",
                    self.name
                )))
            }
        };
        match from {
            // The slot must already hold history from the resume point
            Some(lsn) if !self.slot_exists().await? => {
                return Err(PipelineError::precheck(format!(
                    "replication slot '{}' on {} is gone; changes after {} are no longer retained",
                    self.config.slot,
                    self.name,
                    Position::Lsn(lsn)
                )));
            }
            Some(_) => {}
            None => {
                self.ensure_slot().await?;
            }
        }
        {
            let mut state = self.state.lock();
            state.idle_since = None;
            state.delivered.clear();
        }
        let poll = Poll {
            store: self.store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            from,
            last: None,
            limit: self.config.max_changes.max(1),
            buffer: VecDeque::new(),
            done: false,
        };
        let events = stream::unfold(poll, |mut poll| async move {
            if poll.done {
                return None;
            }
            loop {
                if let Some(event) = poll.buffer.pop_front() {
                    return Some((Ok(event), poll));
                }
                match poll.fetch().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tokio::time::sleep(Duration::from_millis(poll.config.poll_interval_ms)).await;
                    }
                    Err(e) => {
                        poll.done = true;
                        return Some((Err(e), poll));
                    }
                }
            }
        });
        Ok(events.boxed())
    }

    async fn current_position(&self) -> Result<Position> {
        current_wal(self.store.as_ref()).await.map(Position::Lsn)
    }

    async fn prepare(&self) -> Result<Position> {
        match self.ensure_slot().await? {
            Some(created) => Ok(Position::Lsn(created)),
            None => self.current_position().await,
        }
    }

    async fn acknowledge(&self, position: &Position) -> Result<()> {
        let Position::Lsn(upto) = position else {
            return Ok(());
        };
        let target = {
            let mut state = self.state.lock();
            let mut target = None;
            while state.delivered.front().is_some_and(|lsn| lsn < upto) {
                target = state.delivered.pop_front();
            }
            target
        };
        let Some(target) = target else {
            return Ok(());
        };
        let lsn = Position::Lsn(target).to_string();
        let conn = self.store.connect().await.map_err(PipelineError::from_database)?;
        conn.query(ADVANCE_SQL, &[Value::from(self.config.slot.as_str()), Value::from(lsn.as_str())])
            .await
            .map_err(PipelineError::from_database)?;
        debug!(slot = %self.config.slot, lsn = %lsn, "advanced replication slot");
        Ok(())
    }

    async fn is_drained(&self, target: &Position, applied: Option<&Position>) -> Result<bool> {
        let Position::Lsn(target) = target else {
            return Ok(false);
        };
        let state = self.state.lock();
        let polled_past_target = state.idle_since.is_some_and(|wal| wal >= *target);
        let applied_all = match (state.last_delivered, applied) {
            (None, _) => true,
            (Some(last), Some(Position::Lsn(applied))) => *applied >= last,
            (Some(_), _) => false,
        };
        Ok(polled_past_target && applied_all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_rdbc::connection::{Connection, Transaction};
    use sluice_rdbc::store::{ScanRequest, WriteOp};
    use sluice_rdbc::types::{KeyBounds, TableMetadata};
    use crate::error::ErrorClass;

    /// A server with one logical slot. The slot only sees transactions
    /// committed after it was created or last advanced.
    #[derive(Default)]
    struct Server {
        wal: u64,
        xid: u64,
        committed: Vec<(u64, u64, Vec<String>)>,
        slot: Option<u64>,
        advances: Vec<u64>,
    }

    #[derive(Clone, Default)]
    struct SlotServer(Arc<Mutex<Server>>);

    impl SlotServer {
        fn at(wal: u64) -> Self {
            let server = Self::default();
            server.0.lock().wal = wal;
            server
        }

        /// Commit one transaction and return its commit LSN
        fn commit(&self, changes: &[&str]) -> u64 {
            let mut s = self.0.lock();
            s.wal += 100;
            s.xid += 1;
            let (lsn, xid) = (s.wal, s.xid);
            s.committed
                .push((lsn, xid, changes.iter().map(|c| c.to_string()).collect()));
            lsn
        }

        fn insert(&self, id: i64) -> u64 {
            self.commit(&[&format!("table public.t_order: INSERT: order_id[bigint]:{id} amount[bigint]:1")])
        }

        fn slot(&self) -> Option<u64> {
            self.0.lock().slot
        }

        fn advances(&self) -> Vec<u64> {
            self.0.lock().advances.clone()
        }

        fn peek(&self, limit: usize) -> sluice_rdbc::Result<Vec<Row>> {
            let s = self.0.lock();
            let confirmed = s
                .slot
                .ok_or_else(|| sluice_rdbc::Error::query("replication slot \"sluice\" does not exist"))?;
            let mut rows = Vec::new();
            for (lsn, xid, changes) in s.committed.iter().filter(|(lsn, _, _)| *lsn > confirmed) {
                if rows.len() >= limit {
                    break;
                }
                let line = |data: String| {
                    Row::from_pairs([
                        ("lsn", Value::from(Position::Lsn(*lsn).to_string())),
                        ("xid", Value::from(xid.to_string())),
                        ("data", Value::from(data)),
                    ])
                };
                rows.push(line(format!("BEGIN {xid}")));
                rows.extend(changes.iter().cloned().map(&line));
                rows.push(line(format!("COMMIT {xid}")));
            }
            Ok(rows)
        }
    }

    struct Session(SlotServer);

    #[async_trait]
    impl Connection for Session {
        async fn query(&self, sql: &str, params: &[Value]) -> sluice_rdbc::Result<Vec<Row>> {
            let server = &self.0;
            let lsn_row = |lsn: u64| Row::from_pairs([("lsn", Value::from(Position::Lsn(lsn).to_string()))]);
            match sql {
                SLOT_EXISTS_SQL => Ok(server
                    .slot()
                    .map(|_| Row::from_pairs([("slot_name", Value::from("sluice"))]))
                    .into_iter()
                    .collect()),
                CREATE_SLOT_SQL => {
                    let mut s = server.0.lock();
                    let at = s.wal;
                    s.slot = Some(at);
                    Ok(vec![lsn_row(at)])
                }
                PEEK_SQL => {
                    let limit = params[1].as_i64().unwrap_or(0) as usize;
                    server.peek(limit)
                }
                ADVANCE_SQL => {
                    let upto = params[1].as_str().and_then(parse_lsn).unwrap_or(0);
                    let mut s = server.0.lock();
                    s.slot = s.slot.map(|confirmed| confirmed.max(upto));
                    s.advances.push(upto);
                    Ok(vec![])
                }
                _ if sql == current_wal_sql(DatabaseType::PostgreSQL) => {
                    let wal = server.0.lock().wal;
                    Ok(vec![lsn_row(wal)])
                }
                other => Err(sluice_rdbc::Error::query(format!("unexpected statement: {other}"))),
            }
        }

        async fn execute(&self, _sql: &str, _params: &[Value]) -> sluice_rdbc::Result<u64> {
            Err(sluice_rdbc::Error::unsupported("execute"))
        }

        async fn begin(&self) -> sluice_rdbc::Result<Box<dyn Transaction>> {
            Err(sluice_rdbc::Error::unsupported("transactions"))
        }
    }

    #[async_trait]
    impl TableStore for SlotServer {
        fn name(&self) -> &str {
            "src"
        }

        fn database_type(&self) -> DatabaseType {
            DatabaseType::PostgreSQL
        }

        async fn connect(&self) -> sluice_rdbc::Result<Box<dyn Connection>> {
            Ok(Box::new(Session(self.clone())))
        }

        async fn table_metadata(&self, table: &TableName) -> sluice_rdbc::Result<TableMetadata> {
            Err(sluice_rdbc::Error::table_not_found(table.to_string()))
        }

        async fn key_bounds(&self, table: &TableName, _key_column: &str) -> sluice_rdbc::Result<KeyBounds> {
            Err(sluice_rdbc::Error::table_not_found(table.to_string()))
        }

        async fn scan(&self, table: &TableName, _request: &ScanRequest) -> sluice_rdbc::Result<Vec<Row>> {
            Err(sluice_rdbc::Error::table_not_found(table.to_string()))
        }

        async fn count(&self, table: &TableName) -> sluice_rdbc::Result<u64> {
            Err(sluice_rdbc::Error::table_not_found(table.to_string()))
        }

        async fn write(&self, table: &TableName, _ops: &[WriteOp]) -> sluice_rdbc::Result<Vec<u64>> {
            Err(sluice_rdbc::Error::table_not_found(table.to_string()))
        }

        async fn clear(&self, table: &TableName) -> sluice_rdbc::Result<u64> {
            Err(sluice_rdbc::Error::table_not_found(table.to_string()))
        }
    }

    fn poller(server: &SlotServer, max_changes: usize) -> PgLogicalPoller {
        let mut config = PgLogicalConfig::new("sluice");
        config.max_changes = max_changes;
        config.poll_interval_ms = 5;
        PgLogicalPoller::new("src/sluice", Arc::new(server.clone()), config)
    }

    fn order_id(event: &ChangeEvent) -> Option<i64> {
        event.after.as_ref()?.get_by_name("order_id")?.as_i64()
    }

    async fn next(events: &mut EventStream) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_slot_is_created_before_the_watermark() {
        let server = SlotServer::at(100);
        let reader = poller(&server, 100);
        server.insert(1);

        let watermark = reader.prepare().await.unwrap();
        assert_eq!(watermark, Position::Lsn(200));
        assert_eq!(server.slot(), Some(200));

        // Committed while the snapshot copy runs
        let during_copy = server.insert(42);
        let mut events = reader.subscribe(Some(watermark)).await.unwrap();
        let event = next(&mut events).await;
        assert_eq!(order_id(&event), Some(42));
        assert_eq!(event.position, Position::Lsn(during_copy));
        assert_eq!(event.table, TableName::qualified("public", "t_order"));

        // A second prepare keeps the existing slot
        assert_eq!(reader.prepare().await.unwrap(), Position::Lsn(during_copy));
        assert_eq!(server.slot(), Some(200));
    }

    #[tokio::test]
    async fn test_resume_is_inclusive_at_commit_lsn() {
        let server = SlotServer::at(0);
        let reader = poller(&server, 100);
        let start = reader.prepare().await.unwrap();
        server.insert(1);
        let second = server.commit(&[
            "table public.t_order: INSERT: order_id[bigint]:2 amount[bigint]:1",
            "table public.t_order: INSERT: order_id[bigint]:3 amount[bigint]:1",
        ]);
        assert!(Position::Lsn(second) > start);

        let mut events = reader.subscribe(Some(Position::Lsn(second))).await.unwrap();
        let a = next(&mut events).await;
        let b = next(&mut events).await;
        assert_eq!((order_id(&a), order_id(&b)), (Some(2), Some(3)));
        assert_eq!(a.position, Position::Lsn(second));
        assert_eq!(b.position, Position::Lsn(second));
    }

    #[tokio::test]
    async fn test_acknowledge_advances_past_whole_transactions() {
        let server = SlotServer::at(0);
        let reader = poller(&server, 100);
        let start = reader.prepare().await.unwrap();
        let first = server.insert(1);
        let second = server.insert(2);

        let mut events = reader.subscribe(Some(start)).await.unwrap();
        next(&mut events).await;
        next(&mut events).await;

        reader.acknowledge(&Position::Lsn(first)).await.unwrap();
        assert!(server.advances().is_empty());

        reader.acknowledge(&Position::Lsn(second)).await.unwrap();
        assert_eq!(server.advances(), vec![first]);
        assert_eq!(server.slot(), Some(first));

        // Already handed to the slot
        reader.acknowledge(&Position::Lsn(second)).await.unwrap();
        assert_eq!(server.advances(), vec![first]);
    }

    #[tokio::test]
    async fn test_full_window_is_widened() {
        let server = SlotServer::at(0);
        // Each transaction is three rows, so the first window holds one
        let reader = poller(&server, 3);
        let start = reader.prepare().await.unwrap();
        for id in 1..=3 {
            server.insert(id);
        }

        let mut events = reader.subscribe(Some(start)).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(order_id(&next(&mut events).await));
        }
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_drained_after_an_idle_poll() {
        let server = SlotServer::at(0);
        let reader = poller(&server, 100);
        let start = reader.prepare().await.unwrap();
        let lsn = server.insert(7);
        let target = reader.drain_target().await.unwrap();

        let mut events = reader.subscribe(Some(start)).await.unwrap();
        assert_eq!(next(&mut events).await.position, Position::Lsn(lsn));
        assert!(!reader.is_drained(&target, None).await.unwrap());

        // Nothing new; let the stream poll the slot again
        let idle = tokio::time::timeout(Duration::from_millis(100), events.next()).await;
        assert!(idle.is_err());
        assert!(!reader.is_drained(&target, None).await.unwrap());
        assert!(reader.is_drained(&target, Some(&Position::Lsn(lsn))).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_without_slot_fails() {
        let server = SlotServer::at(500);
        let reader = poller(&server, 100);
        let err = reader.subscribe(Some(Position::Lsn(300))).await.err().unwrap();
        assert_eq!(err.class(), ErrorClass::PrecheckFailed);
        assert_eq!(server.slot(), None);

        let mut config = PgLogicalConfig::new("sluice");
        config.create_slot = false;
        let strict = PgLogicalPoller::new("src/sluice", Arc::new(server.clone()), config);
        assert_eq!(strict.prepare().await.unwrap_err().class(), ErrorClass::PrecheckFailed);
    }

    #[test]
    fn test_parse_begin_commit() {
        assert_eq!(
            parse_test_decoding("BEGIN 529").unwrap(),
            TestDecodingLine::Begin { xid: 529 }
        );
        assert_eq!(
            parse_test_decoding("COMMIT 529").unwrap(),
            TestDecodingLine::Commit { xid: 529 }
        );
    }

    #[test]
    fn test_parse_insert_with_quotes_and_spaces() {
        let line = "table public.t_order: INSERT: order_id[bigint]:1 note[character varying]:'it''s a test' amount[numeric]:12.50 paid[boolean]:true gone[text]:null";
        let TestDecodingLine::Change { table, op, old, new } = parse_test_decoding(line).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(table, TableName::qualified("public", "t_order"));
        assert_eq!(op, ChangeOp::Insert);
        assert!(old.is_none());
        let new = new.unwrap();
        assert_eq!(new.get_by_name("order_id"), Some(&Value::Int64(1)));
        assert_eq!(new.get_by_name("note"), Some(&Value::from("it's a test")));
        assert_eq!(
            new.get_by_name("amount"),
            Some(&Value::Decimal(Decimal::from_str("12.50").unwrap()))
        );
        assert_eq!(new.get_by_name("paid"), Some(&Value::Bool(true)));
        assert_eq!(new.get_by_name("gone"), Some(&Value::Null));
    }

    #[test]
    fn test_parse_update_with_old_key_and_delete() {
        let line = "table public.t_order: UPDATE: old-key: order_id[bigint]:1 new-tuple: order_id[bigint]:2 status[text]:'paid' blob[text]:unchanged-toast-datum";
        let TestDecodingLine::Change { old, new, .. } = parse_test_decoding(line).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(old.unwrap().get_by_name("order_id"), Some(&Value::Int64(1)));
        let new = new.unwrap();
        assert_eq!(new.get_by_name("order_id"), Some(&Value::Int64(2)));
        assert!(new.get_by_name("blob").is_none());

        let line = "table public.t_order: DELETE: order_id[bigint]:2";
        let TestDecodingLine::Change { op, old, new, .. } = parse_test_decoding(line).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(op, ChangeOp::Delete);
        assert!(new.is_none());
        assert_eq!(old.unwrap().len(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_test_decoding("hello").is_err());
        assert!(parse_test_decoding("table public.t: TRUNCATE: (no-flags)").is_err());
        assert!(parse_test_decoding("table public.t: INSERT: id[integer]:'open").is_err());
    }

    #[test]
    fn test_update_without_old_key_reuses_new_tuple() {
        let event = to_event(
            TableName::new("t"),
            ChangeOp::Update,
            None,
            Some(Row::from_pairs([("id", Value::Int32(1))])),
        )
        .unwrap();
        assert_eq!(event.before, event.after);
        assert!(to_event(TableName::new("t"), ChangeOp::Delete, None, None).is_none());
    }
}
