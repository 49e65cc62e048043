/// Error types for the database access core
///
/// Every failure leaving the core is one of these types. Nothing is converted
/// into a default value: callers either get their rows or a typed error with
/// enough context (label, timing, truncated query) to diagnose the problem.
///
/// # Taxonomy
///
/// - [`ConfigurationError`]: missing or invalid connection parameters (fatal at startup)
/// - [`DbError::NotInitialized`]: a query was attempted before the pool was created
/// - [`DbError::PoolTimeout`]: no connection became free within the connect timeout
/// - [`DbError::Query`]: the backing store rejected or failed a statement
/// - [`DbError::Transaction`]: BEGIN or COMMIT failed
///
/// Rollback failures are never returned. They are logged, and the error that
/// caused the rollback is what the caller sees.

use crate::db::executor::QueryKind;
use crate::db::value::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the core
pub type DbResult<T> = Result<T, DbError>;

/// SQLSTATE for unique constraint violations
const UNIQUE_VIOLATION: &str = "23505";

/// Invalid or incomplete connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// One or more required keys are absent (every missing key is listed)
    #[error("missing required database configuration: {}", keys.join(", "))]
    Missing { keys: Vec<String> },

    /// A key is present but its value is unusable
    #[error("invalid database configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },

    /// The configuration source itself could not be read
    #[error("failed to load database configuration: {0}")]
    Source(String),
}

/// Faults reported by a backend connection
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The transport failed; the connection must not be reused
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the statement (syntax, constraint, permission...)
    #[error("{message}")]
    Database {
        message: String,
        code: Option<String>,
        constraint: Option<String>,
    },

    /// A returned cell could not be converted into a [`Value`]
    #[error("failed to decode row: {0}")]
    Decode(String),
}

impl BackendError {
    /// Creates a server-side error without SQLSTATE details
    pub fn database(message: impl Into<String>) -> Self {
        BackendError::Database {
            message: message.into(),
            code: None,
            constraint: None,
        }
    }

    /// Whether the connection that produced this error is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BackendError::Connection(_))
    }

    /// SQLSTATE code, when the server sent one
    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Name of the violated constraint, when the server sent one
    pub fn constraint(&self) -> Option<&str> {
        match self {
            BackendError::Database { constraint, .. } => constraint.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => BackendError::Database {
                message: db_err.message().to_string(),
                code: db_err.code().map(|c| c.into_owned()),
                constraint: db_err.constraint().map(str::to_string),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => BackendError::Connection(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. } => BackendError::Decode(err.to_string()),
            other => BackendError::database(other.to_string()),
        }
    }
}

/// A typed row mapping failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("column `{0}` not found in row")]
    MissingColumn(String),

    #[error("column `{column}`: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("query returned no rows")]
    NoRows,
}

/// A statement failed against the backing store
///
/// Carries the context needed to diagnose the failure without leaking oversized
/// payloads: the query text is truncated, credentials are never included.
#[derive(Debug, Error)]
#[error("{kind} query `{}` failed after {}ms: {message}", label.as_deref().unwrap_or("unlabeled"), elapsed.as_millis())]
pub struct QueryExecutionError {
    /// Caller-provided identifier, if any
    pub label: Option<String>,

    /// Statement category used for logging
    pub kind: QueryKind,

    /// Query text, truncated for logging
    pub query: String,

    /// Parameters bound to the statement
    pub params: Vec<Value>,

    /// Time spent before the failure surfaced
    pub elapsed: Duration,

    /// Message of the original fault
    pub message: String,

    /// The original fault
    #[source]
    pub source: BackendError,
}

/// Which step of the transaction protocol failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPhase::Begin => write!(f, "BEGIN"),
            TransactionPhase::Commit => write!(f, "COMMIT"),
            TransactionPhase::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

/// Errors surfaced by the database access core
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Programming error: the pool was never initialized
    #[error("database pool has not been initialized")]
    NotInitialized,

    /// Connect timeout elapsed while every connection was leased
    #[error("timed out after {}ms waiting for a database connection", waited.as_millis())]
    PoolTimeout { waited: Duration },

    /// The pool has been shut down
    #[error("database pool is closed")]
    PoolClosed,

    /// Opening a new connection failed
    #[error("failed to open database connection: {0}")]
    Connect(#[source] BackendError),

    #[error(transparent)]
    Query(#[from] Box<QueryExecutionError>),

    /// BEGIN or COMMIT failed
    #[error("transaction {phase} failed: {source}")]
    Transaction {
        phase: TransactionPhase,
        #[source]
        source: BackendError,
    },

    #[error("failed to decode row: {0}")]
    Decode(#[from] DecodeError),
}

impl DbError {
    /// Whether a retry with backoff may succeed
    ///
    /// Only pool saturation is considered transient; the core itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::PoolTimeout { .. })
    }

    /// Whether the error is a unique constraint violation
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::Query(err) => err.source.code() == Some(UNIQUE_VIOLATION),
            _ => false,
        }
    }

    /// Name of the violated constraint, if the backing store reported one
    pub fn constraint(&self) -> Option<&str> {
        match self {
            DbError::Query(err) => err.source.constraint(),
            _ => None,
        }
    }
}
