/// Database access core for Storefront
///
/// This module provides configuration, connection pooling, query execution and
/// transactions. Everything that touches the backing store goes through a
/// [`database::Database`] handle created once at startup.
///
/// # Modules
///
/// - `config`: connection parameters and validation
/// - `error`: error taxonomy
/// - `value`: tagged parameter/cell values and typed row decoding
/// - `backend`: connection traits, PostgreSQL (sqlx) and in-memory backends
/// - `pool`: bounded connection pool
/// - `database`: process-scoped handle with explicit init/shutdown
/// - `executor`: instrumented statement execution
/// - `transaction`: BEGIN/COMMIT/ROLLBACK around a unit of work
///
/// Repositories built on top live in the `models` module at crate root level.
///
/// # Example
///
/// ```no_run
/// use storefront_shared::db::config::PoolConfig;
/// use storefront_shared::db::database::Database;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db = Database::postgres(PoolConfig::from_env()?);
///     db.init().await?;
///
///     let rows = db.select("SELECT 1", &[], "startup.probe").await?;
///     assert_eq!(rows.len(), 1);
///
///     db.shutdown().await;
///     Ok(())
/// }
/// ```

pub mod backend;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod pool;
pub mod transaction;
pub mod value;

pub use database::Database;
pub use error::{DbError, DbResult};
pub use executor::{QueryRequest, QueryResult};
pub use transaction::TransactionContext;
pub use value::{FromRow, Row, Value};
