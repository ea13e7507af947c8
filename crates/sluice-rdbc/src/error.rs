//! Error types for sluice-rdbc
//!
//! Every backend error is mapped onto an [`ErrorCategory`] so the pipeline
//! can decide between retrying a batch and failing the owning task.

use std::fmt;
use thiserror::Error;

/// Result type for sluice-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for retry classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network or session level failure
    Connection,
    /// Statement rejected by the server
    Query,
    /// Transaction could not be started or committed
    Transaction,
    /// Constraint violation
    Constraint,
    /// Value could not be converted between representations
    TypeConversion,
    /// Operation timed out
    Timeout,
    /// Deadlock or serialization failure
    Deadlock,
    /// Login rejected
    Authentication,
    /// Invalid connection configuration
    Configuration,
    /// No pooled connection became available in time
    PoolExhausted,
    /// Missing table or column
    Schema,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are worth retrying
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Deadlock | Self::PoolExhausted
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Transaction => "transaction",
            Self::Constraint => "constraint",
            Self::TypeConversion => "type_conversion",
            Self::Timeout => "timeout",
            Self::Deadlock => "deadlock",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::PoolExhausted => "pool_exhausted",
            Self::Schema => "schema",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Main error type for sluice-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Transaction control failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("constraint violation: {message}")]
    Constraint { message: String },

    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("deadlock detected: {message}")]
    Deadlock { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock { .. } => ErrorCategory::Deadlock,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Schema { .. } | Self::TableNotFound { .. } => ErrorCategory::Schema,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Classify a server-reported SQLSTATE.
    ///
    /// Class 08 is a connection exception, 40001/40P01 are serialization
    /// failures and deadlocks, class 23 is an integrity violation, class 28
    /// is an authorization failure and 42P01/42S02 mean the table is missing.
    pub fn from_sql_state(state: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match state {
            "40001" | "40P01" => Self::Deadlock { message },
            "42P01" | "42S02" => Self::TableNotFound { table: message },
            "57014" => Self::Timeout { message },
            s if s.starts_with("08") => Self::connection(message),
            s if s.starts_with("23") => Self::Constraint { message },
            s if s.starts_with("28") => Self::Authentication { message },
            _ => Self::query(format!("[{state}] {message}")),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error carrying the offending statement
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a table-not-found error
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
