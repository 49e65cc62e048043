/// Backing-store connections
///
/// The pool never talks to a driver directly. It opens connections through a
/// [`ConnectionFactory`] and runs statements through the [`Connection`] trait,
/// so the same pool, executor and transaction code runs against PostgreSQL in
/// production and against the in-process [`mock`] backend in tests.
///
/// # Implementations
///
/// - [`postgres::PgConnectionFactory`]: one sqlx `PgConnection` per pooled connection
/// - [`mock::MockFactory`]: deterministic in-memory backend with fault injection

use crate::db::error::BackendError;
use crate::db::value::{Row, Value};
use async_trait::async_trait;

pub mod mock;
pub mod postgres;

/// Everything a statement produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutput {
    /// Rows returned (SELECT, or DML with RETURNING)
    pub rows: Vec<Row>,

    /// Rows inserted, updated or deleted
    pub rows_affected: u64,
}

/// A live connection to the backing store
///
/// Parameters are always sent separately from the statement text.
#[async_trait]
pub trait Connection: Send {
    /// Runs one statement with bound parameters
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput, BackendError>;

    /// Cheap round trip used to detect dead idle connections
    async fn ping(&mut self) -> Result<(), BackendError>;

    /// Closes the connection gracefully
    async fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// Opens new connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Short name used in logs (e.g. "postgres")
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Connection>, BackendError>;
}
