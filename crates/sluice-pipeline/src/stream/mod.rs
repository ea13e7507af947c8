//! Change stream readers
//!
//! A reader delivers a source's row changes in position order. Positions are
//! monotonic per source; `subscribe` is inclusive, so the event at the start
//! position may be delivered again after a restart and consumers must apply
//! changes idempotently.
//!
//! - [`MemoryChangeLog`]: in-process log with live subscriptions
//! - [`PgLogicalPoller`]: PostgreSQL / openGauss logical replication slot read
//!   over SQL with the `test_decoding` plugin

mod memory;
mod pg_logical;

pub use memory::MemoryChangeLog;
pub use pg_logical::{parse_test_decoding, PgLogicalConfig, PgLogicalPoller, TestDecodingLine};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::event::ChangeEvent;
use crate::position::Position;

/// Stream of decoded changes; an `Err` item ends the subscription
pub type EventStream = BoxStream<'static, Result<ChangeEvent>>;

/// Source of row changes for one datasource
#[async_trait]
pub trait ChangeStreamReader: Send + Sync {
    /// Reader name for logs
    fn name(&self) -> &str;

    /// Changes at or after `from`; `None` starts at the oldest retained change
    async fn subscribe(&self, from: Option<Position>) -> Result<EventStream>;

    /// Position of the latest change the source has committed
    async fn current_position(&self) -> Result<Position>;

    /// Make the source retain changes from now on and return the position
    /// retention starts at. Called once per job, before the snapshot copy.
    async fn prepare(&self) -> Result<Position> {
        self.current_position().await
    }

    /// Every change up to `position` is durably applied downstream
    async fn acknowledge(&self, _position: &Position) -> Result<()> {
        Ok(())
    }

    /// Marker of everything the source has committed so far
    async fn drain_target(&self) -> Result<Position> {
        self.current_position().await
    }

    /// Whether `applied` covers every change committed before `target` was taken
    async fn is_drained(&self, target: &Position, applied: Option<&Position>) -> Result<bool> {
        Ok(applied.is_some_and(|a| a >= target))
    }
}
