use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use sluice_rdbc::{Row, TableName};
use std::sync::Arc;
use tokio::sync::watch;

use super::{ChangeStreamReader, EventStream};
use crate::error::{PipelineError, Result};
use crate::event::ChangeEvent;
use crate::position::Position;

#[derive(Debug, Default)]
struct LogFaults {
    failing_subscribes: u32,
    disconnect_after: Option<usize>,
}

#[derive(Debug)]
struct LogInner {
    name: String,
    events: RwLock<Vec<ChangeEvent>>,
    appended: watch::Sender<usize>,
    faults: Mutex<LogFaults>,
    acknowledged: Mutex<Option<Position>>,
}

/// In-memory ordered change log.
///
/// The n-th appended event gets position `#n`. Subscriptions stay open and
/// deliver events appended later.
#[derive(Debug, Clone)]
pub struct MemoryChangeLog {
    inner: Arc<LogInner>,
}

impl MemoryChangeLog {
    /// Create an empty log
    pub fn new(name: impl Into<String>) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(LogInner {
                name: name.into(),
                events: RwLock::new(Vec::new()),
                appended,
                faults: Mutex::new(LogFaults::default()),
                acknowledged: Mutex::new(None),
            }),
        }
    }

    /// Append an event, replacing its position with the next sequence number
    pub fn push(&self, event: ChangeEvent) -> Position {
        let mut events = self.inner.events.write();
        let position = Position::Sequence(events.len() as u64 + 1);
        events.push(event.at(position.clone()));
        let len = events.len();
        drop(events);
        self.inner.appended.send_replace(len);
        position
    }

    /// Append an insert
    pub fn insert(&self, table: &TableName, after: Row) -> Position {
        self.push(ChangeEvent::insert(Position::origin(), table.clone(), after))
    }

    /// Append an update
    pub fn update(&self, table: &TableName, before: Row, after: Row) -> Position {
        self.push(ChangeEvent::update(
            Position::origin(),
            table.clone(),
            before,
            after,
        ))
    }

    /// Append a delete
    pub fn delete(&self, table: &TableName, before: Row) -> Position {
        self.push(ChangeEvent::delete(Position::origin(), table.clone(), before))
    }

    /// Number of events in the log
    pub fn len(&self) -> usize {
        self.inner.events.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every event
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.inner.events.read().clone()
    }

    /// Highest acknowledged position
    pub fn acknowledged(&self) -> Option<Position> {
        self.inner.acknowledged.lock().clone()
    }

    /// Fail the next `times` subscribe calls with a transient error
    pub fn fail_subscribes(&self, times: u32) {
        self.inner.faults.lock().failing_subscribes = times;
    }

    /// End the next subscription with a transient error after `events` deliveries
    pub fn disconnect_after(&self, events: usize) {
        self.inner.faults.lock().disconnect_after = Some(events);
    }

    fn start_index(&self, from: Option<&Position>) -> Result<usize> {
        match from {
            None => Ok(0),
            Some(Position::Sequence(n)) => Ok(n.saturating_sub(1) as usize),
            Some(other) => Err(PipelineError::config(format!(
                "memory change log {} cannot start at {other}",
                self.inner.name
            ))),
        }
    }
}

fn disconnected() -> PipelineError {
    PipelineError::TransientIo(sluice_rdbc::Error::connection("change stream disconnected"))
}

#[async_trait]
impl ChangeStreamReader for MemoryChangeLog {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn subscribe(&self, from: Option<Position>) -> Result<EventStream> {
        let start = self.start_index(from.as_ref())?;
        let disconnect_after = {
            let mut faults = self.inner.faults.lock();
            if faults.failing_subscribes > 0 {
                faults.failing_subscribes -= 1;
                return Err(disconnected());
            }
            faults.disconnect_after.take()
        };

        let inner = self.inner.clone();
        let rx = self.inner.appended.subscribe();
        let state = (inner, rx, start, 0usize, false);
        let events = stream::unfold(state, move |(inner, mut rx, idx, delivered, done)| async move {
            if done {
                return None;
            }
            loop {
                if disconnect_after.is_some_and(|limit| delivered >= limit) {
                    return Some((Err(disconnected()), (inner, rx, idx, delivered, true)));
                }
                let next = inner.events.read().get(idx).cloned();
                if let Some(event) = next {
                    return Some((Ok(event), (inner, rx, idx + 1, delivered + 1, false)));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(events.boxed())
    }

    async fn current_position(&self) -> Result<Position> {
        Ok(Position::Sequence(self.len() as u64))
    }

    async fn acknowledge(&self, position: &Position) -> Result<()> {
        let mut acked = self.inner.acknowledged.lock();
        if acked.as_ref().is_none_or(|a| a < position) {
            *acked = Some(position.clone());
        }
        Ok(())
    }
}
