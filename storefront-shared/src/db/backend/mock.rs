/// In-memory backend for tests and demos
///
/// Understands a tiny, SQL-shaped command vocabulary and keeps committed
/// tables in shared memory, so pool, executor and transaction behavior can be
/// exercised without a database server. Transactions are buffered per
/// connection and only become visible to other connections on COMMIT.
///
/// # Commands
///
/// | Command | Effect |
/// |---|---|
/// | `SELECT 1` | one row `{"?column?": 1}` |
/// | `SELECT pg_backend_pid()` | this connection's id |
/// | `BEGIN` / `COMMIT` / `ROLLBACK` | transaction control |
/// | `INSERT INTO t (a, b)` | inserts one row built from the parameters |
/// | `SELECT * FROM t` | committed rows plus this connection's pending writes |
/// | `DELETE FROM t` | removes every row of `t` |
/// | `SLEEP ms` | suspends for `ms` milliseconds |
/// | `DISCONNECT` | kills this connection |
///
/// Anything else fails with a syntax error (SQLSTATE 42601).
///
/// # Example
///
/// ```
/// use storefront_shared::db::backend::{mock::MockFactory, Connection, ConnectionFactory};
/// use storefront_shared::db::value::Value;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = MockFactory::new();
/// let mut conn = factory.connect().await?;
///
/// conn.query("INSERT INTO items (sku)", &[Value::from("MUG")]).await?;
/// let out = conn.query("SELECT * FROM items", &[]).await?;
/// assert_eq!(out.rows.len(), 1);
/// assert_eq!(factory.table("items").len(), 1);
/// # Ok(())
/// # }
/// ```

use crate::db::backend::{Connection, ConnectionFactory, StatementOutput};
use crate::db::error::BackendError;
use crate::db::value::{Row, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const SYNTAX_ERROR: &str = "42601";

#[derive(Default)]
struct MockState {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    statements: AtomicUsize,
    refuse_connects: AtomicBool,
    fail_rollbacks: AtomicBool,
    connect_delay_ms: AtomicU64,
    ping_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,
    /// Connections opened before the current generation are dead
    generation: AtomicU64,
}

impl MockState {
    fn tables(&self) -> MutexGuard<'_, HashMap<String, Vec<Row>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Factory for [`MockFactory`] connections, cloneable so tests can keep a handle
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened so far
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections closed gracefully so far
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Statements received across all connections (pings excluded)
    pub fn statements(&self) -> usize {
        self.state.statements.load(Ordering::SeqCst)
    }

    /// Makes subsequent `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Makes subsequent `ROLLBACK` statements fail with a connection error
    pub fn fail_rollbacks(&self, fail: bool) {
        self.state.fail_rollbacks.store(fail, Ordering::SeqCst);
    }

    /// Adds latency to every `connect`
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Adds latency to every `ping`
    pub fn set_ping_delay(&self, delay: Duration) {
        self.state
            .ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Adds latency to every `close`
    pub fn set_close_delay(&self, delay: Duration) {
        self.state
            .close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Kills every connection opened so far
    pub fn kill_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Committed rows of a table
    pub fn table(&self, name: &str) -> Vec<Row> {
        self.state
            .tables()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, BackendError> {
        pause(&self.state.connect_delay_ms).await;

        if self.state.refuse_connects.load(Ordering::SeqCst) {
            return Err(BackendError::Connection("connection refused".to_string()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Box::new(MockConnection {
            id,
            generation: self.state.generation.load(Ordering::SeqCst),
            state: self.state.clone(),
            pending: None,
            dead: false,
        }))
    }
}

#[derive(Clone)]
enum PendingWrite {
    Insert(String, Row),
    Clear(String),
}

struct MockConnection {
    id: u64,
    generation: u64,
    state: Arc<MockState>,
    pending: Option<Vec<PendingWrite>>,
    dead: bool,
}

impl MockConnection {
    fn check_alive(&self) -> Result<(), BackendError> {
        if self.dead || self.generation < self.state.generation.load(Ordering::SeqCst) {
            return Err(BackendError::Connection(
                "server closed the connection unexpectedly".to_string(),
            ));
        }
        Ok(())
    }

    fn write(&mut self, op: PendingWrite) -> u64 {
        if let Some(pending) = self.pending.as_mut() {
            let affected = match &op {
                PendingWrite::Insert(..) => 1,
                PendingWrite::Clear(_) => 0,
            };
            pending.push(op);
            return affected;
        }

        apply(&mut self.state.tables(), op)
    }

    fn select(&self, table: &str) -> Vec<Row> {
        let mut view = self.state.tables().clone();
        if let Some(pending) = &self.pending {
            for op in pending {
                apply(&mut view, op.clone());
            }
        }
        view.remove(table).unwrap_or_default()
    }
}

async fn pause(delay_ms: &AtomicU64) {
    let delay = delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

fn apply(tables: &mut HashMap<String, Vec<Row>>, op: PendingWrite) -> u64 {
    match op {
        PendingWrite::Insert(table, row) => {
            tables.entry(table).or_default().push(row);
            1
        }
        PendingWrite::Clear(table) => tables.remove(&table).map(|rows| rows.len() as u64).unwrap_or(0),
    }
}

fn single(column: &str, value: Value) -> StatementOutput {
    let mut row = Row::new();
    row.push(column, value);
    StatementOutput {
        rows: vec![row],
        rows_affected: 0,
    }
}

fn syntax_error(sql: &str) -> BackendError {
    let token = sql.split_whitespace().next().unwrap_or("");
    BackendError::Database {
        message: format!("syntax error at or near \"{}\"", token),
        code: Some(SYNTAX_ERROR.to_string()),
        constraint: None,
    }
}

/// Parses `INSERT INTO t (a, b)` into the table name and column list
fn parse_insert(rest: &str, params: &[Value]) -> Option<(String, Row)> {
    let (table, columns) = match rest.split_once('(') {
        Some((table, cols)) => {
            let cols = cols.trim_end().strip_suffix(')')?;
            let names: Vec<String> = cols.split(',').map(|c| c.trim().to_string()).collect();
            (table.trim(), names)
        }
        None => {
            let names = (1..=params.len()).map(|i| format!("col{}", i)).collect();
            (rest.trim(), names)
        }
    };

    if table.is_empty() || columns.len() != params.len() {
        return None;
    }

    let row = columns.into_iter().zip(params.iter().cloned()).collect();
    Some((table.to_ascii_lowercase(), row))
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput, BackendError> {
        self.check_alive()?;
        self.state.statements.fetch_add(1, Ordering::SeqCst);

        let statement = sql.trim().trim_end_matches(';');
        let upper = statement.to_ascii_uppercase();

        match upper.as_str() {
            "SELECT 1" => return Ok(single("?column?", Value::Int(1))),
            "SELECT PG_BACKEND_PID()" => {
                return Ok(single("pg_backend_pid", Value::Int(self.id as i64)))
            }
            "BEGIN" => {
                self.pending.get_or_insert_with(Vec::new);
                return Ok(StatementOutput::default());
            }
            "COMMIT" => {
                if let Some(pending) = self.pending.take() {
                    let mut tables = self.state.tables();
                    for op in pending {
                        apply(&mut tables, op);
                    }
                }
                return Ok(StatementOutput::default());
            }
            "ROLLBACK" => {
                if self.state.fail_rollbacks.load(Ordering::SeqCst) {
                    self.dead = true;
                    return Err(BackendError::Connection(
                        "connection reset during ROLLBACK".to_string(),
                    ));
                }
                self.pending = None;
                return Ok(StatementOutput::default());
            }
            "DISCONNECT" => {
                self.dead = true;
                return Err(BackendError::Connection(
                    "terminating connection due to administrator command".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(ms) = upper.strip_prefix("SLEEP ") {
            let ms: u64 = ms.trim().parse().map_err(|_| syntax_error(statement))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(StatementOutput::default());
        }

        if upper.starts_with("INSERT INTO ") {
            let rest = &statement["INSERT INTO ".len()..];
            let (table, row) = parse_insert(rest, params).ok_or_else(|| syntax_error(statement))?;
            let rows_affected = self.write(PendingWrite::Insert(table, row));
            return Ok(StatementOutput {
                rows: Vec::new(),
                rows_affected,
            });
        }

        if upper.starts_with("SELECT * FROM ") {
            let table = statement["SELECT * FROM ".len()..].trim().to_ascii_lowercase();
            return Ok(StatementOutput {
                rows: self.select(&table),
                rows_affected: 0,
            });
        }

        if upper.starts_with("DELETE FROM ") {
            let table = statement["DELETE FROM ".len()..].trim().to_ascii_lowercase();
            let rows_affected = self.write(PendingWrite::Clear(table));
            return Ok(StatementOutput {
                rows: Vec::new(),
                rows_affected,
            });
        }

        Err(syntax_error(statement))
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        pause(&self.state.ping_delay_ms).await;
        self.check_alive()
    }

    async fn close(self: Box<Self>) -> Result<(), BackendError> {
        pause(&self.state.close_delay_ms).await;
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
