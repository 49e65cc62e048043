/// Query execution
///
/// Every statement outside a transaction goes through [`Database::execute`]:
/// acquire a connection, run the statement with its bound parameters, time it,
/// release the connection. The connection is released on every path; if the
/// calling future is dropped mid-query the lease is discarded instead, which
/// also frees its slot.
///
/// Failures come back as [`DbError::Query`] wrapping a
/// [`QueryExecutionError`] with the label, statement kind, truncated query
/// text, bound parameters and elapsed time.
///
/// # Logging
///
/// - `debug`: every statement (label, kind, elapsed, rows)
/// - `warn`: statements slower than `slow_query_threshold`
/// - `error`: failed statements
///
/// Parameters are never logged, only attached to the returned error.
///
/// # Example
///
/// ```no_run
/// use storefront_shared::db::database::Database;
/// use storefront_shared::db::executor::QueryRequest;
/// use storefront_shared::db::value::Value;
///
/// # async fn example(db: Database) -> Result<(), storefront_shared::db::error::DbError> {
/// let result = db
///     .select(
///         "SELECT id, name FROM products WHERE stock > $1",
///         &[Value::Int(0)],
///         "products.in_stock",
///     )
///     .await?;
///
/// for row in result.rows() {
///     let name: String = row.get("name")?;
///     println!("{}", name);
/// }
///
/// let request = QueryRequest::new("DELETE FROM carts WHERE updated_at < now() - interval '30 days'")
///     .with_label("carts.expire");
/// let expired = db.execute(request).await?.rows_affected();
/// # Ok(())
/// # }
/// ```

use crate::db::database::Database;
use crate::db::error::{DbError, DbResult, DecodeError, QueryExecutionError};
use crate::db::pool::PooledConnection;
use crate::db::value::{FromRow, Row, Value};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Query text longer than this is truncated in logs and errors
pub const MAX_LOGGED_QUERY_LEN: usize = 256;

const UNLABELED: &str = "unlabeled";

/// Statement category, used for logging only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    /// Anything else (DDL, transaction control, utility statements)
    Execute,
}

impl QueryKind {
    /// Guesses the kind from the leading keyword
    pub fn infer(sql: &str) -> Self {
        let keyword = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" | "TABLE" => QueryKind::Select,
            "INSERT" => QueryKind::Insert,
            "UPDATE" => QueryKind::Update,
            "DELETE" => QueryKind::Delete,
            _ => QueryKind::Execute,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryKind::Select => "SELECT",
            QueryKind::Insert => "INSERT",
            QueryKind::Update => "UPDATE",
            QueryKind::Delete => "DELETE",
            QueryKind::Execute => "EXECUTE",
        };
        f.write_str(s)
    }
}

/// A statement, its ordered parameters and an optional label for logs
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    sql: String,
    params: Vec<Value>,
    label: Option<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            label: None,
        }
    }

    /// Appends the next positional parameter (`$1`, `$2`, ...)
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Replaces all parameters
    pub fn with_params(mut self, params: impl IntoIterator<Item = Value>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    /// Identifier used in logs and errors (e.g. `users.find_by_email`)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// Fully materialized outcome of a statement
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    rows: Vec<Row>,
    rows_affected: u64,
    elapsed: Duration,
}

impl QueryResult {
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Rows inserted, updated or deleted
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Maps every row onto `T`
    pub fn decode<T: FromRow>(&self) -> Result<Vec<T>, DecodeError> {
        self.rows.iter().map(T::from_row).collect()
    }

    /// Maps the first row onto `T`, failing with [`DecodeError::NoRows`] if there is none
    pub fn one<T: FromRow>(&self) -> Result<T, DecodeError> {
        self.rows.first().ok_or(DecodeError::NoRows).and_then(T::from_row)
    }

    /// Maps the first row onto `T`, if any
    pub fn optional<T: FromRow>(&self) -> Result<Option<T>, DecodeError> {
        self.rows.first().map(T::from_row).transpose()
    }
}

/// Truncates query text for logs and errors
pub fn truncate_query(sql: &str) -> String {
    match sql.char_indices().nth(MAX_LOGGED_QUERY_LEN) {
        Some((cut, _)) => format!("{}...", &sql[..cut]),
        None => sql.to_string(),
    }
}

/// Runs one statement on a leased connection with timing, logging and error context
pub(crate) async fn run_statement(
    conn: &mut PooledConnection,
    request: &QueryRequest,
    kind: QueryKind,
    slow_threshold: Duration,
) -> DbResult<QueryResult> {
    let label = request.label().unwrap_or(UNLABELED);
    let start = Instant::now();
    let outcome = conn.query(request.sql(), request.params()).await;
    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;

    match outcome {
        Ok(output) => {
            let rows = output.rows.len();

            if !slow_threshold.is_zero() && elapsed >= slow_threshold {
                warn!(
                    label,
                    kind = %kind,
                    elapsed_ms,
                    rows,
                    connection_id = conn.id(),
                    query = %truncate_query(request.sql()),
                    "Slow query"
                );
            } else {
                debug!(
                    label,
                    kind = %kind,
                    elapsed_ms,
                    rows,
                    rows_affected = output.rows_affected,
                    connection_id = conn.id(),
                    "Query executed"
                );
            }

            Ok(QueryResult {
                rows: output.rows,
                rows_affected: output.rows_affected,
                elapsed,
            })
        }
        Err(source) => {
            let query = truncate_query(request.sql());
            error!(
                label,
                kind = %kind,
                elapsed_ms,
                connection_id = conn.id(),
                broken = conn.is_broken(),
                query = %query,
                error = %source,
                "Query failed"
            );

            Err(DbError::Query(Box::new(QueryExecutionError {
                label: request.label().map(str::to_string),
                kind,
                query,
                params: request.params().to_vec(),
                elapsed,
                message: source.to_string(),
                source,
            })))
        }
    }
}

impl Database {
    /// Runs a statement on a pooled connection
    ///
    /// The statement kind used in logs is inferred from its leading keyword.
    ///
    /// # Errors
    ///
    /// - [`DbError::NotInitialized`] before [`Database::init`]
    /// - [`DbError::PoolTimeout`] / [`DbError::PoolClosed`] / [`DbError::Connect`] from acquisition
    /// - [`DbError::Query`] if the statement fails
    pub async fn execute(&self, request: QueryRequest) -> DbResult<QueryResult> {
        let kind = QueryKind::infer(request.sql());
        self.run(request, kind).await
    }

    pub async fn select(&self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Select).await
    }

    pub async fn insert(&self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Insert).await
    }

    pub async fn update(&self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Update).await
    }

    pub async fn delete(&self, sql: &str, params: &[Value], label: &str) -> DbResult<QueryResult> {
        self.run(request(sql, params, label), QueryKind::Delete).await
    }

    /// Runs a query and maps the first row onto `T`
    ///
    /// Fails with [`DecodeError::NoRows`] if the query returns nothing.
    pub async fn fetch_one<T: FromRow>(&self, request: QueryRequest) -> DbResult<T> {
        Ok(self.run(request, QueryKind::Select).await?.one()?)
    }

    /// Runs a query and maps the first row onto `T`, if any
    pub async fn fetch_optional<T: FromRow>(&self, request: QueryRequest) -> DbResult<Option<T>> {
        Ok(self.run(request, QueryKind::Select).await?.optional()?)
    }

    /// Runs a query and maps every row onto `T`
    pub async fn fetch_all<T: FromRow>(&self, request: QueryRequest) -> DbResult<Vec<T>> {
        Ok(self.run(request, QueryKind::Select).await?.decode()?)
    }

    async fn run(&self, request: QueryRequest, kind: QueryKind) -> DbResult<QueryResult> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;

        let result = run_statement(
            &mut conn,
            &request,
            kind,
            self.config().slow_query_threshold,
        )
        .await;

        conn.release().await;
        result
    }
}

pub(crate) fn request(sql: &str, params: &[Value], label: &str) -> QueryRequest {
    QueryRequest::new(sql)
        .with_params(params.iter().cloned())
        .with_label(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::mock::MockFactory;
    use crate::db::config::PoolConfig;
    use std::sync::Arc;

    async fn database(max: u32) -> (Database, MockFactory) {
        let factory = MockFactory::new();
        let config = PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
            .with_max_connections(max)
            .with_connect_timeout(Duration::from_millis(100));
        let db = Database::new(config, Arc::new(factory.clone()));
        db.init().await.unwrap();
        (db, factory)
    }

    #[test]
    fn test_kind_inferred_from_keyword() {
        assert_eq!(QueryKind::infer("  select * from users"), QueryKind::Select);
        assert_eq!(QueryKind::infer("WITH x AS (SELECT 1) SELECT * FROM x"), QueryKind::Select);
        assert_eq!(QueryKind::infer("INSERT INTO users"), QueryKind::Insert);
        assert_eq!(QueryKind::infer("update users set"), QueryKind::Update);
        assert_eq!(QueryKind::infer("DELETE FROM users"), QueryKind::Delete);
        assert_eq!(QueryKind::infer("BEGIN"), QueryKind::Execute);
        assert_eq!(QueryKind::infer(""), QueryKind::Execute);
    }

    #[test]
    fn test_truncate_query() {
        assert_eq!(truncate_query("SELECT 1"), "SELECT 1");

        let long = format!("SELECT {}", "x".repeat(1_000));
        let truncated = truncate_query(&long);
        assert_eq!(truncated.chars().count(), MAX_LOGGED_QUERY_LEN + 3);
        assert!(truncated.ends_with("..."));

        // Multi-byte characters are never split
        let wide = "é".repeat(300);
        assert_eq!(truncate_query(&wide).chars().count(), MAX_LOGGED_QUERY_LEN + 3);
    }

    #[test]
    fn test_request_builder() {
        let request = QueryRequest::new("SELECT * FROM users WHERE id = $1")
            .bind(42_i64)
            .with_label("users.find_by_id");

        assert_eq!(request.params(), &[Value::Int(42)]);
        assert_eq!(request.label(), Some("users.find_by_id"));
    }

    #[tokio::test]
    async fn test_execute_before_init_fails() {
        let factory = MockFactory::new();
        let config = PoolConfig::new("localhost", 5432, "shop", "secret", "shop");
        let db = Database::new(config, Arc::new(factory.clone()));

        let err = db.execute(QueryRequest::new("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, DbError::NotInitialized));
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_insert_then_select() {
        let (db, _factory) = database(2).await;

        let inserted = db
            .insert(
                "INSERT INTO products (sku, stock)",
                &[Value::from("MUG"), Value::Int(3)],
                "products.create",
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected(), 1);

        let result = db
            .select("SELECT * FROM products", &[], "products.list")
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows()[0].get::<String>("sku").unwrap(), "MUG");
    }

    #[tokio::test]
    async fn test_connection_released_on_success_and_failure() {
        let (db, _factory) = database(1).await;

        for i in 0..5 {
            let sql = if i % 2 == 0 { "SELECT 1" } else { "SELEC 1" };
            let _ = db.execute(QueryRequest::new(sql)).await;

            let stats = db.stats().unwrap();
            assert_eq!(stats.leased, 0);
            assert_eq!(stats.idle, 1);
            assert_eq!(stats.acquisitions, i + 1);
        }
    }

    #[tokio::test]
    async fn test_failure_carries_context() {
        let (db, _factory) = database(1).await;
        let sql = format!("SELEC {}", "x".repeat(400));

        let err = db
            .execute(
                QueryRequest::new(sql.clone())
                    .bind("secret-param")
                    .with_label("broken.query"),
            )
            .await
            .unwrap_err();

        let DbError::Query(err) = err else {
            panic!("expected a query error");
        };
        assert_eq!(err.label.as_deref(), Some("broken.query"));
        assert_eq!(err.kind, QueryKind::Execute);
        assert_eq!(err.query, truncate_query(&sql));
        assert_eq!(err.params, vec![Value::from("secret-param")]);
        assert_eq!(err.source.code(), Some("42601"));
        assert!(err.message.contains("syntax error"));
    }

    #[tokio::test]
    async fn test_fetch_helpers_decode_rows() {
        let (db, _factory) = database(1).await;

        let one: Row = db.fetch_one(QueryRequest::new("SELECT 1")).await.unwrap();
        assert_eq!(one.get::<i64>("?column?").unwrap(), 1);

        let missing: Option<Row> = db
            .fetch_optional(QueryRequest::new("SELECT * FROM nothing"))
            .await
            .unwrap();
        assert!(missing.is_none());

        let err = db
            .fetch_one::<Row>(QueryRequest::new("SELECT * FROM nothing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Decode(DecodeError::NoRows)));
    }

    #[tokio::test]
    async fn test_cancelled_query_frees_slot() {
        let (db, factory) = database(1).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            db.execute(QueryRequest::new("SLEEP 5000")),
        )
        .await;
        assert!(cancelled.is_err());

        // Discarded connection must not block the only slot
        let result = db.execute(QueryRequest::new("SELECT 1")).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(db.stats().unwrap().leased, 0);
        assert_eq!(factory.connects(), 2);
    }

    #[tokio::test]
    async fn test_connection_fault_retires_connection() {
        let (db, _factory) = database(1).await;

        let before: Row = db
            .fetch_one(QueryRequest::new("SELECT pg_backend_pid()"))
            .await
            .unwrap();

        let err = db.execute(QueryRequest::new("DISCONNECT")).await.unwrap_err();
        assert!(matches!(&err, DbError::Query(e) if e.source.is_connection_error()));

        let after: Row = db
            .fetch_one(QueryRequest::new("SELECT pg_backend_pid()"))
            .await
            .unwrap();
        assert_ne!(
            before.get::<i64>("pg_backend_pid").unwrap(),
            after.get::<i64>("pg_backend_pid").unwrap()
        );
    }
}
