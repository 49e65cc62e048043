/// Transaction coordination
///
/// [`Database::with_transaction`] runs a unit of work on one connection
/// between `BEGIN` and `COMMIT`. The unit of work returns a `Result`, and the
/// coordinator branches on it:
///
/// - `Ok(value)`: `COMMIT`, then return `value`
/// - `Err(e)`: `ROLLBACK` (best effort), then return `e` unchanged
///
/// A failed `ROLLBACK` is logged and the connection is retired; it never
/// replaces the error that caused the rollback. The connection is released
/// exactly once on every path. If the calling future is dropped mid-transaction
/// the connection is discarded and the server rolls back on disconnect.
///
/// Nested transactions are not supported. Calling `with_transaction` from
/// inside a unit of work opens an unrelated transaction on another connection.
///
/// # Example
///
/// ```no_run
/// use storefront_shared::db::database::Database;
/// use storefront_shared::db::error::DbError;
/// use storefront_shared::db::value::Value;
///
/// # async fn example(db: Database, from: i64, to: i64) -> Result<(), DbError> {
/// db.with_transaction(|tx| {
///     Box::pin(async move {
///         tx.update(
///             "UPDATE products SET stock = stock - 1 WHERE id = $1",
///             &[Value::Int(from)],
///             "products.take",
///         )
///         .await?;
///         tx.update(
///             "UPDATE products SET stock = stock + 1 WHERE id = $1",
///             &[Value::Int(to)],
///             "products.put",
///         )
///         .await?;
///         Ok(())
///     })
/// })
/// .await
/// # }
/// ```

use crate::db::database::Database;
use crate::db::error::{DbError, DbResult, TransactionPhase};
use crate::db::executor::{request, run_statement, QueryKind, QueryRequest, QueryResult};
use crate::db::pool::PooledConnection;
use crate::db::value::{FromRow, Value};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// A connection inside an open transaction
///
/// Owned by the running unit of work; statements run strictly in the order
/// they are issued.
pub struct TransactionContext {
    conn: PooledConnection,
    slow_query_threshold: Duration,
}

impl TransactionContext {
    /// Runs a statement inside the transaction
    pub async fn execute(&mut self, request: QueryRequest) -> DbResult<QueryResult> {
        let kind = QueryKind::infer(request.sql());
        self.run(request, kind).await
    }

    pub async fn select(&mut self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Select).await
    }

    pub async fn insert(&mut self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Insert).await
    }

    pub async fn update(&mut self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Update).await
    }

    pub async fn delete(&mut self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Delete).await
    }

    pub async fn fetch_one<T: FromRow>(&mut self, request: QueryRequest) -> DbResult<T> {
        Ok(self.run(request, QueryKind::Select).await?.one()?)
    }

    pub async fn fetch_optional<T: FromRow>(&mut self, request: QueryRequest) -> DbResult<Option<T>> {
        Ok(self.run(request, QueryKind::Select).await?.optional()?)
    }

    pub async fn fetch_all<T: FromRow>(&mut self, request: QueryRequest) -> DbResult<Vec<T>> {
        Ok(self.run(request, QueryKind::Select).await?.decode()?)
    }

    /// Id of the connection the transaction runs on
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    async fn run(&mut self, request: QueryRequest, kind: QueryKind) -> DbResult<QueryResult> {
        run_statement(&mut self.conn, &request, kind, self.slow_query_threshold).await
    }
}

impl Database {
    /// Runs `unit_of_work` atomically
    ///
    /// The closure receives the transaction context and returns a boxed future,
    /// so it should capture owned data (`async move`).
    ///
    /// # Errors
    ///
    /// - [`DbError::NotInitialized`] and acquisition errors, converted into `E`
    /// - [`DbError::Transaction`] if `BEGIN` or `COMMIT` fails
    /// - whatever the unit of work returned, unchanged, after rolling back
    pub async fn with_transaction<T, E, F>(&self, unit_of_work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut TransactionContext) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        let connection_id = conn.id();
        let start = Instant::now();

        if let Err(source) = conn.query("BEGIN", &[]).await {
            error!(connection_id, error = %source, "Failed to begin transaction");
            conn.release().await;
            return Err(DbError::Transaction {
                phase: TransactionPhase::Begin,
                source,
            }
            .into());
        }
        debug!(connection_id, "Transaction started");

        let mut ctx = TransactionContext {
            conn,
            slow_query_threshold: self.config().slow_query_threshold,
        };
        let outcome = unit_of_work(&mut ctx).await;
        let mut conn = ctx.conn;

        match outcome {
            Ok(value) => {
                let committed = conn.query("COMMIT", &[]).await;
                conn.release().await;

                match committed {
                    Ok(_) => {
                        debug!(
                            connection_id,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Transaction committed"
                        );
                        Ok(value)
                    }
                    Err(source) => {
                        error!(connection_id, error = %source, "Failed to commit transaction");
                        Err(DbError::Transaction {
                            phase: TransactionPhase::Commit,
                            source,
                        }
                        .into())
                    }
                }
            }
            Err(err) => {
                rollback(&mut conn).await;
                conn.release().await;
                Err(err)
            }
        }
    }
}

async fn rollback(conn: &mut PooledConnection) {
    match conn.query("ROLLBACK", &[]).await {
        Ok(_) => debug!(connection_id = conn.id(), "Transaction rolled back"),
        Err(source) => {
            // Transaction state unknown: never hand this connection out again
            conn.mark_broken();
            let err = DbError::Transaction {
                phase: TransactionPhase::Rollback,
                source,
            };
            warn!(
                connection_id = conn.id(),
                error = %err,
                "Rollback failed; discarding connection"
            );
        }
    }
}
