//! Per-job connection pool
//!
//! The pool never holds more than `max_size` connections. Borrowed
//! connections go back to the idle list when the [`PooledConnection`] is
//! dropped; connections that fail validation are discarded and replaced.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Maximum number of open connections
    pub max_size: usize,
    /// Maximum time to wait for a free connection
    pub acquire_timeout: Duration,
    /// Validate idle connections before handing them out
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_size: 4,
            acquire_timeout: Duration::from_secs(30),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Pool config for a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set the maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size.max(1);
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enable or disable validation on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened
    pub created: u64,
    /// Connections handed out
    pub acquired: u64,
    /// Connections discarded after failed validation
    pub discarded: u64,
    /// Acquire attempts that timed out
    pub timeouts: u64,
}

struct PoolShared {
    idle: Mutex<Vec<Box<dyn Connection>>>,
    created: AtomicU64,
    acquired: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
}

/// Bounded connection pool
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    permits: Arc<Semaphore>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("idle", &self.idle())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool; connections are opened lazily
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size.max(1)));
        Self {
            config,
            factory,
            permits,
            shared: Arc::new(PoolShared {
                idle: Mutex::new(Vec::new()),
                created: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow a connection, opening one if none is idle
    pub async fn get(&self) -> Result<PooledConnection> {
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::internal("connection pool closed")),
            Err(_) => {
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::PoolExhausted {
                    message: format!(
                        "no connection available within {:?} (max {})",
                        self.config.acquire_timeout, self.config.max_size
                    ),
                });
            }
        };

        loop {
            let candidate = self.shared.idle.lock().pop();
            let Some(conn) = candidate else { break };
            if !self.config.test_on_borrow || conn.is_valid().await {
                self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledConnection::new(conn, self.shared.clone(), permit));
            }
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("discarding invalid pooled connection");
            let _ = conn.close().await;
        }

        let conn = self.factory.connect(&self.config.connection).await?;
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        self.shared.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection::new(conn, self.shared.clone(), permit))
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Number of connections currently borrowed
    pub fn in_use(&self) -> usize {
        self.config
            .max_size
            .saturating_sub(self.permits.available_permits())
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.shared.created.load(Ordering::Relaxed),
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Close idle connections and refuse new borrows
    pub async fn close(&self) -> Result<()> {
        self.permits.close();
        let idle: Vec<_> = std::mem::take(&mut *self.shared.idle.lock());
        for conn in idle {
            let _ = conn.close().await;
        }
        Ok(())
    }
}

/// A connection borrowed from a [`ConnectionPool`]
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl PooledConnection {
    fn new(
        conn: Box<dyn Connection>,
        shared: Arc<PoolShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            shared,
            _permit: permit,
        }
    }

    fn inner(&self) -> Result<&dyn Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| Error::internal("pooled connection already returned"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.idle.lock().push(conn);
        }
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner()?.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner()?.execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.inner()?.begin().await
    }

    async fn is_valid(&self) -> bool {
        match self.inner() {
            Ok(conn) => conn.is_valid().await,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseType;
    use std::sync::atomic::AtomicBool;

    struct StubConnection {
        valid: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(vec![Row::from_pairs([("one", 1i32)])])
        }

        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(Error::unsupported("stub"))
        }

        async fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    struct StubFactory {
        valid: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
            Ok(Box::new(StubConnection {
                valid: self.valid.clone(),
            }))
        }

        fn database_type(&self) -> DatabaseType {
            DatabaseType::PostgreSQL
        }
    }

    fn pool(max: usize, valid: Arc<AtomicBool>) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig::new("postgres://stub")
                .with_max_size(max)
                .with_acquire_timeout(Duration::from_millis(50)),
            Arc::new(StubFactory { valid }),
        )
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let pool = pool(2, Arc::new(AtomicBool::new(true)));
        {
            let conn = pool.get().await.unwrap();
            assert_eq!(conn.query("SELECT 1", &[]).await.unwrap().len(), 1);
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.idle(), 1);
        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().acquired, 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = pool(1, Arc::new(AtomicBool::new(true)));
        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_invalid_idle_connection_is_replaced() {
        let valid = Arc::new(AtomicBool::new(true));
        let pool = pool(1, valid.clone());
        drop(pool.get().await.unwrap());
        valid.store(false, Ordering::SeqCst);
        let _conn = pool.get().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.created, 2);
    }
}
