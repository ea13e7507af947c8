//! Error taxonomy for migration jobs
//!
//! Every [`PipelineError`] maps to an [`ErrorClass`], and every class maps to
//! a stable `(sql_state, vendor_code)` pair. Vendor codes are composed the
//! same way across the platform:
//!
//! - feature class: `20000 + feature_code * 100 + error_code`
//! - kernel class: `10000 + kernel_code * 1000 + error_code`
//!
//! Pipeline errors live in kernel 8 (`18000..=18999`); algorithm lookup
//! errors belong to the sharding feature (feature 1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Kernel code of the data pipeline
pub const PIPELINE_KERNEL_CODE: u32 = 8;

/// Feature code of sharding
pub const SHARDING_FEATURE_CODE: u32 = 1;

/// SQL state values from the X/Open catalogue used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XOpenSqlState {
    /// `00000`
    Success,
    /// `08000`
    ConnectionException,
    /// `0A000`
    FeatureNotSupported,
    /// `22023`
    InvalidParameterValue,
    /// `25000`
    InvalidTransactionState,
    /// `42501`
    InsufficientPrivilege,
    /// `42704`
    NotFound,
    /// `42710`
    DuplicateObject,
    /// `57014`
    QueryCanceled,
    /// `HY000`
    GeneralError,
}

impl XOpenSqlState {
    /// Five character state value
    pub const fn value(self) -> &'static str {
        match self {
            Self::Success => "00000",
            Self::ConnectionException => "08000",
            Self::FeatureNotSupported => "0A000",
            Self::InvalidParameterValue => "22023",
            Self::InvalidTransactionState => "25000",
            Self::InsufficientPrivilege => "42501",
            Self::NotFound => "42704",
            Self::DuplicateObject => "42710",
            Self::QueryCanceled => "57014",
            Self::GeneralError => "HY000",
        }
    }
}

impl fmt::Display for XOpenSqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

/// Which composition rule a [`SqlErrorCode`] uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Kernel subsystem error
    Kernel,
    /// Feature error
    Feature,
}

/// A `(sql_state, vendor_code)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlErrorCode {
    kind: CodeKind,
    class_code: u32,
    error_code: u32,
    sql_state: XOpenSqlState,
}

impl SqlErrorCode {
    /// Feature error code; `feature_code < 100`, `error_code < 100`
    pub const fn feature(feature_code: u32, error_code: u32, sql_state: XOpenSqlState) -> Self {
        Self {
            kind: CodeKind::Feature,
            class_code: feature_code,
            error_code,
            sql_state,
        }
    }

    /// Kernel error code; `kernel_code < 10`, `error_code < 1000`
    pub const fn kernel(kernel_code: u32, error_code: u32, sql_state: XOpenSqlState) -> Self {
        Self {
            kind: CodeKind::Kernel,
            class_code: kernel_code,
            error_code,
            sql_state,
        }
    }

    /// Composition rule of this code
    pub const fn kind(&self) -> CodeKind {
        self.kind
    }

    /// Whether both parts are inside their ranges
    pub const fn is_in_range(&self) -> bool {
        match self.kind {
            CodeKind::Feature => self.class_code < 100 && self.error_code < 100,
            CodeKind::Kernel => self.class_code < 10 && self.error_code < 1000,
        }
    }

    /// Composed vendor code
    pub const fn vendor_code(&self) -> u32 {
        match self.kind {
            CodeKind::Feature => 20000 + self.class_code * 100 + self.error_code,
            CodeKind::Kernel => 10000 + self.class_code * 1000 + self.error_code,
        }
    }

    /// SQL state
    pub const fn sql_state(&self) -> XOpenSqlState {
        self.sql_state
    }
}

/// Error class shown in job status and used for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Pre-flight verification failed
    PrecheckFailed,
    /// Source lacks the replication capability
    InsufficientPrivilege,
    /// Source server variables do not allow change capture
    UnsupportedServerConfig,
    /// Retriable network or database failure
    TransientIo,
    /// Snapshot copy of a split failed permanently
    FatalCopy,
    /// Incremental apply failed permanently
    FatalApply,
    /// A change matched zero or several target rows
    ConflictWarning,
    /// Other datasource failure
    Database,
    /// Checkpoint persistence failed
    Checkpoint,
    /// Another owner holds the job lease
    LeaseHeld,
    /// Operation not allowed in the current job state
    InvalidStateTransition,
    /// Operation cancelled
    Cancelled,
    /// A wait ran out of time
    Timeout,
    /// No job with that id
    JobNotFound,
    /// A job with that id exists already
    JobAlreadyExists,
    /// Invalid job configuration
    Config,
    /// Unknown sharding algorithm type
    UnknownAlgorithm,
    /// Invalid sharding algorithm properties
    InvalidAlgorithmProps,
    /// A row could not be routed to a data node
    Routing,
}

impl ErrorClass {
    /// Every class, in code order
    pub const ALL: [ErrorClass; 19] = [
        Self::JobNotFound,
        Self::JobAlreadyExists,
        Self::PrecheckFailed,
        Self::InsufficientPrivilege,
        Self::UnsupportedServerConfig,
        Self::TransientIo,
        Self::FatalCopy,
        Self::FatalApply,
        Self::ConflictWarning,
        Self::Database,
        Self::Checkpoint,
        Self::LeaseHeld,
        Self::InvalidStateTransition,
        Self::Cancelled,
        Self::Timeout,
        Self::Config,
        Self::UnknownAlgorithm,
        Self::InvalidAlgorithmProps,
        Self::Routing,
    ];

    /// Static code of this class
    pub const fn code(self) -> SqlErrorCode {
        use XOpenSqlState as S;
        let k = PIPELINE_KERNEL_CODE;
        match self {
            Self::JobNotFound => SqlErrorCode::kernel(k, 2, S::NotFound),
            Self::JobAlreadyExists => SqlErrorCode::kernel(k, 3, S::DuplicateObject),
            Self::PrecheckFailed => SqlErrorCode::kernel(k, 50, S::GeneralError),
            Self::InsufficientPrivilege => SqlErrorCode::kernel(k, 51, S::InsufficientPrivilege),
            Self::UnsupportedServerConfig => SqlErrorCode::kernel(k, 52, S::FeatureNotSupported),
            Self::TransientIo => SqlErrorCode::kernel(k, 60, S::ConnectionException),
            Self::FatalCopy => SqlErrorCode::kernel(k, 61, S::GeneralError),
            Self::FatalApply => SqlErrorCode::kernel(k, 62, S::GeneralError),
            Self::ConflictWarning => SqlErrorCode::kernel(k, 63, S::GeneralError),
            Self::Database => SqlErrorCode::kernel(k, 64, S::GeneralError),
            Self::Checkpoint => SqlErrorCode::kernel(k, 70, S::GeneralError),
            Self::LeaseHeld => SqlErrorCode::kernel(k, 71, S::InvalidTransactionState),
            Self::InvalidStateTransition => {
                SqlErrorCode::kernel(k, 80, S::InvalidTransactionState)
            }
            Self::Cancelled => SqlErrorCode::kernel(k, 81, S::QueryCanceled),
            Self::Timeout => SqlErrorCode::kernel(k, 82, S::QueryCanceled),
            Self::Config => SqlErrorCode::kernel(k, 90, S::InvalidParameterValue),
            Self::UnknownAlgorithm => {
                SqlErrorCode::feature(SHARDING_FEATURE_CODE, 90, S::GeneralError)
            }
            Self::InvalidAlgorithmProps => {
                SqlErrorCode::feature(SHARDING_FEATURE_CODE, 91, S::InvalidParameterValue)
            }
            Self::Routing => SqlErrorCode::feature(SHARDING_FEATURE_CODE, 92, S::GeneralError),
        }
    }

    /// Short operator hint
    pub const fn remediation(self) -> &'static str {
        match self {
            Self::PrecheckFailed => "fix the reported datasource problem and start the job again",
            Self::InsufficientPrivilege => {
                "grant the replication privilege to the source user and start the job again"
            }
            Self::UnsupportedServerConfig => {
                "change the source server variable and restart the server if required"
            }
            Self::TransientIo => "the job retries automatically; check datasource connectivity",
            Self::FatalCopy => "inspect the failing split, then resume the job",
            Self::FatalApply => "inspect the failing change, then resume the job",
            Self::ConflictWarning => {
                "target rows diverged from the source; run a consistency check"
            }
            Self::Database => "inspect the datasource error, then resume the job",
            Self::Checkpoint => "check the state directory is writable, then resume the job",
            Self::LeaseHeld => "stop the other owner or wait for its lease to expire",
            Self::InvalidStateTransition => "check the job state with `status`",
            Self::Cancelled => "resume the job to continue",
            Self::Timeout => "wait for the job to catch up with the source, then retry",
            Self::JobNotFound => "check the job id",
            Self::JobAlreadyExists => "remove the existing job or choose another id",
            Self::Config => "fix the job configuration",
            Self::UnknownAlgorithm => "use one of the types listed by `algorithms`",
            Self::InvalidAlgorithmProps => "fix the algorithm properties",
            Self::Routing => "check the sharding column values of the source table",
        }
    }

    /// Whether components retry errors of this class
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::TransientIo)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PrecheckFailed => "precheck_failed",
            Self::InsufficientPrivilege => "insufficient_privilege",
            Self::UnsupportedServerConfig => "unsupported_server_config",
            Self::TransientIo => "transient_io",
            Self::FatalCopy => "fatal_copy",
            Self::FatalApply => "fatal_apply",
            Self::ConflictWarning => "conflict_warning",
            Self::Database => "database",
            Self::Checkpoint => "checkpoint",
            Self::LeaseHeld => "lease_held",
            Self::InvalidStateTransition => "invalid_state_transition",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::JobNotFound => "job_not_found",
            Self::JobAlreadyExists => "job_already_exists",
            Self::Config => "config",
            Self::UnknownAlgorithm => "unknown_algorithm",
            Self::InvalidAlgorithmProps => "invalid_algorithm_props",
            Self::Routing => "routing",
        };
        f.write_str(s)
    }
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pre-flight verification failed
    #[error("Precheck failed: {0}")]
    PrecheckFailed(String),

    /// Source lacks the replication capability
    #[error("{0}")]
    InsufficientPrivilege(String),

    /// Source server variable has an unsupported value
    #[error("Unsupported server config on {datasource}: {variable} is '{actual}', required '{required}'")]
    UnsupportedServerConfig {
        /// Datasource name
        datasource: String,
        /// Variable name
        variable: String,
        /// Current value
        actual: String,
        /// Required value
        required: String,
    },

    /// Retriable failure
    #[error("Transient I/O error: {0}")]
    TransientIo(#[source] sluice_rdbc::Error),

    /// Snapshot copy failed permanently
    #[error("Copy failed for job {job_id}, split {split_id}: {message}")]
    FatalCopy {
        /// Job id
        job_id: String,
        /// Split id
        split_id: String,
        /// Cause
        message: String,
    },

    /// Incremental apply failed permanently
    #[error("Apply failed for job {job_id} at {position}: {message}")]
    FatalApply {
        /// Job id
        job_id: String,
        /// Change position
        position: String,
        /// Cause
        message: String,
    },

    /// Unknown sharding algorithm type
    #[error("Unknown sharding algorithm type: {type_name}")]
    UnknownAlgorithm {
        /// Requested type name
        type_name: String,
    },

    /// Invalid sharding algorithm properties
    #[error("Invalid properties for algorithm {type_name}: {message}")]
    InvalidAlgorithmProps {
        /// Algorithm type
        type_name: String,
        /// What is wrong
        message: String,
    },

    /// Row cannot be routed
    #[error("Routing error: {0}")]
    Routing(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint persistence failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Lease owned by someone else
    #[error("Job {job_id} is leased by {owner}")]
    LeaseHeld {
        /// Job id
        job_id: String,
        /// Current owner
        owner: String,
    },

    /// Operation not allowed in the current state
    #[error("Cannot {operation} job {job_id} in state {state}")]
    InvalidStateTransition {
        /// Job id
        job_id: String,
        /// Requested operation
        operation: String,
        /// Current state
        state: String,
    },

    /// Unknown job
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Job id in use
    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    /// Datasource failure outside copy and apply
    #[error("Database error: {0}")]
    Database(#[from] sluice_rdbc::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// A wait ran out of time
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl PipelineError {
    /// Create a precheck error
    pub fn precheck(msg: impl Into<String>) -> Self {
        Self::PrecheckFailed(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a routing error
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Create an invalid algorithm props error
    pub fn algorithm_props(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAlgorithmProps {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state transition error
    pub fn invalid_transition(
        job_id: impl Into<String>,
        operation: impl Into<String>,
        state: impl fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            job_id: job_id.into(),
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Classify a datasource error: retriable ones become [`Self::TransientIo`]
    pub fn from_database(e: sluice_rdbc::Error) -> Self {
        if e.is_retriable() {
            Self::TransientIo(e)
        } else {
            Self::Database(e)
        }
    }

    /// Taxonomy class
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PrecheckFailed(_) => ErrorClass::PrecheckFailed,
            Self::InsufficientPrivilege(_) => ErrorClass::InsufficientPrivilege,
            Self::UnsupportedServerConfig { .. } => ErrorClass::UnsupportedServerConfig,
            Self::TransientIo(_) => ErrorClass::TransientIo,
            Self::FatalCopy { .. } => ErrorClass::FatalCopy,
            Self::FatalApply { .. } => ErrorClass::FatalApply,
            Self::UnknownAlgorithm { .. } => ErrorClass::UnknownAlgorithm,
            Self::InvalidAlgorithmProps { .. } => ErrorClass::InvalidAlgorithmProps,
            Self::Routing(_) => ErrorClass::Routing,
            Self::Config(_) => ErrorClass::Config,
            Self::Checkpoint(_) | Self::Io(_) | Self::Json(_) => ErrorClass::Checkpoint,
            Self::LeaseHeld { .. } => ErrorClass::LeaseHeld,
            Self::InvalidStateTransition { .. } => ErrorClass::InvalidStateTransition,
            Self::JobNotFound(_) => ErrorClass::JobNotFound,
            Self::JobAlreadyExists(_) => ErrorClass::JobAlreadyExists,
            Self::Database(e) if e.is_retriable() => ErrorClass::TransientIo,
            Self::Database(_) => ErrorClass::Database,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Timeout(_) => ErrorClass::Timeout,
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }

    /// Vendor code of this error
    pub fn vendor_code(&self) -> u32 {
        self.class().code().vendor_code()
    }

    /// SQL state of this error
    pub fn sql_state(&self) -> XOpenSqlState {
        self.class().code().sql_state()
    }

    /// Status record of this error
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.class(), self.to_string())
    }
}

/// Error as recorded in the checkpoint and shown in job status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Taxonomy class
    pub class: ErrorClass,
    /// Vendor code
    pub code: u32,
    /// SQL state
    pub sql_state: String,
    /// Error text
    pub message: String,
    /// Operator hint
    pub remediation: String,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    /// Build a report for `class`
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        let code = class.code();
        Self {
            class,
            code: code.vendor_code(),
            sql_state: code.sql_state().value().to_string(),
            message: message.into(),
            remediation: class.remediation().to_string(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.sql_state, self.code, self.class, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_code_composition() {
        let code = SqlErrorCode::feature(1, 1, XOpenSqlState::GeneralError);
        assert_eq!(code.vendor_code(), 20101);
        assert_eq!(code.sql_state().value(), "HY000");

        let code = SqlErrorCode::feature(99, 10, XOpenSqlState::GeneralError);
        assert_eq!(code.vendor_code(), 29910);
        assert!(code.is_in_range());
    }

    #[test]
    fn test_kernel_code_composition() {
        let code = SqlErrorCode::kernel(8, 50, XOpenSqlState::GeneralError);
        assert_eq!(code.vendor_code(), 18050);
        assert!(!SqlErrorCode::kernel(10, 0, XOpenSqlState::GeneralError).is_in_range());
        assert!(!SqlErrorCode::feature(1, 100, XOpenSqlState::GeneralError).is_in_range());
    }

    #[test]
    fn test_code_table_is_in_range_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for class in ErrorClass::ALL {
            let code = class.code();
            assert!(code.is_in_range(), "{class} out of range");
            match code.kind() {
                CodeKind::Kernel => assert!((18000..=18999).contains(&code.vendor_code())),
                CodeKind::Feature => assert!((20100..=20199).contains(&code.vendor_code())),
            }
            assert!(seen.insert(code.vendor_code()), "{class} reuses a code");
        }
    }

    #[test]
    fn test_classification() {
        let transient = PipelineError::from_database(sluice_rdbc::Error::connection("reset"));
        assert_eq!(transient.class(), ErrorClass::TransientIo);
        assert!(transient.is_retriable());

        let fatal = PipelineError::from_database(sluice_rdbc::Error::internal("boom"));
        assert_eq!(fatal.class(), ErrorClass::Database);
        assert!(!fatal.is_retriable());

        let err = PipelineError::UnknownAlgorithm {
            type_name: "NOPE".into(),
        };
        assert_eq!(err.vendor_code(), 20190);
    }

    #[test]
    fn test_report() {
        let report = PipelineError::InsufficientPrivilege("no replication".into()).report();
        assert_eq!(report.class, ErrorClass::InsufficientPrivilege);
        assert_eq!(report.code, 18051);
        assert_eq!(report.sql_state, "42501");

        let json = serde_json::to_string(&report).unwrap();
        let back: ErrorReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
