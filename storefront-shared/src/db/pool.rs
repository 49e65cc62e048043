/// Database connection pool management
///
/// This module provides the bounded connection pool behind the query executor
/// and the transaction coordinator. It owns every live connection to the
/// backing store; nothing else in the process opens one.
///
/// # Guarantees
///
/// - At most `max_connections` connections are leased at any time (a
///   semaphore slot is held for the whole lease).
/// - At most `max_connections` connections are live (idle, leased or being
///   opened) at any time. Every open first reserves a slot in the live count.
/// - `acquire` waits at most `connect_timeout` in total, including the time
///   spent opening a new connection; a timed-out wait leaves every counter
///   but `timeouts` unchanged.
/// - A lease is released exactly once: [`ConnectionPool::release`] consumes it,
///   and a lease dropped without release (cancelled caller) discards its
///   connection and frees its slot.
/// - Connections are retired instead of reused after `max_uses` statements or
///   once flagged broken; a replacement is opened in the background.
/// - Faults on idle connections are broadcast as [`PoolFault`]s and logged,
///   never raised to callers.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use storefront_shared::db::backend::postgres::PgConnectionFactory;
/// use storefront_shared::db::config::PoolConfig;
/// use storefront_shared::db::pool::ConnectionPool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PoolConfig::from_env()?;
///     let factory = Arc::new(PgConnectionFactory::new(&config));
///     let pool = ConnectionPool::connect(Arc::new(config), factory).await?;
///
///     let mut conn = pool.acquire().await?;
///     let out = conn.query("SELECT 1", &[]).await?;
///     assert_eq!(out.rows.len(), 1);
///     pool.release(conn).await;
///
///     pool.shutdown().await;
///     Ok(())
/// }
/// ```

use crate::db::backend::{Connection, ConnectionFactory, StatementOutput};
use crate::db::config::PoolConfig;
use crate::db::error::{BackendError, DbError, DbResult};
use crate::db::value::Value;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Liveness probe run on the first connection
const PROBE_QUERY: &str = "SELECT 1";

/// Lower bound for the idle reaper period
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Buffered fault notifications per subscriber
const FAULT_CHANNEL_CAPACITY: usize = 64;

/// Asynchronous pool-level fault
///
/// Delivered to [`ConnectionPool::subscribe`] receivers and logged by the
/// listener registered at startup. Never returned to a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolFault {
    /// An idle connection failed its health check and was discarded
    IdleConnectionLost { connection_id: u64, error: String },

    /// A background replacement for a retired connection could not be opened
    ReplacementFailed { error: String },

    /// Closing a connection reported an error
    CloseFailed { connection_id: u64, error: String },
}

impl fmt::Display for PoolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolFault::IdleConnectionLost { connection_id, error } => {
                write!(f, "idle connection {} lost: {}", connection_id, error)
            }
            PoolFault::ReplacementFailed { error } => {
                write!(f, "failed to open replacement connection: {}", error)
            }
            PoolFault::CloseFailed { connection_id, error } => {
                write!(f, "failed to close connection {}: {}", connection_id, error)
            }
        }
    }
}

/// Why a connection left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Reached `max_uses` statements
    MaxUses,
    /// Flagged broken by a connection-level error
    Broken,
    /// Idle longer than `idle_timeout`
    IdleTimeout,
    /// Failed a health check while idle
    FailedPing,
    /// The pool is shutting down
    Shutdown,
    /// The lease was dropped without being released
    Abandoned,
}

/// Point-in-time pool statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured maximum of leased connections
    pub max_connections: usize,

    /// Live connections (idle, leased, or being opened)
    pub size: usize,

    /// Connections waiting in the idle set
    pub idle: usize,

    /// Connections currently leased
    pub leased: usize,

    /// Connections opened since startup
    pub connections_opened: u64,

    /// Connections closed since startup
    pub connections_closed: u64,

    /// Successful acquisitions
    pub acquisitions: u64,

    /// Acquisitions that gave up after `connect_timeout`
    pub timeouts: u64,

    /// Connections retired (max uses, broken, idle expiry, failed ping)
    pub retired: u64,
}

#[derive(Default)]
struct PoolCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    retired: AtomicU64,
}

/// Why opening a connection did not produce one
enum OpenError {
    /// Every live slot is taken
    NoSlot,
    /// The deadline passed before the backend answered
    TimedOut,
    /// The backend refused or failed
    Failed(BackendError),
}

/// A claimed slot in the live count, given back on drop unless committed
struct SlotReservation<'a> {
    live: &'a AtomicUsize,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    id: u64,
    uses: u64,
    created_at: Instant,
    idle_since: Instant,
}

/// Bounded pool of backing-store connections
pub struct ConnectionPool {
    config: Arc<PoolConfig>,
    factory: Arc<dyn ConnectionFactory>,
    /// LIFO: most recently returned connection at the back
    idle: Mutex<VecDeque<IdleConnection>>,
    /// One permit per leasable slot
    semaphore: Arc<Semaphore>,
    /// Open connections plus reserved slots for opens in flight
    live: AtomicUsize,
    leased: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    counters: PoolCounters,
    faults: broadcast::Sender<PoolFault>,
    background: CancellationToken,
}

impl ConnectionPool {
    /// Creates the pool and verifies the backing store is reachable
    ///
    /// Opens one connection, runs the liveness probe (`SELECT 1`), keeps the
    /// connection idle, then starts the fault listener and the idle reaper.
    ///
    /// # Errors
    ///
    /// - [`DbError::Connect`] if the first connection cannot be opened or the
    ///   probe fails
    pub async fn connect(
        config: Arc<PoolConfig>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> DbResult<Arc<Self>> {
        info!(
            backend = factory.name(),
            target = %config.target(),
            max_connections = config.max_connections,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            max_uses = config.max_uses,
            ssl_mode = %config.ssl_mode,
            "Creating database connection pool"
        );

        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        let pool = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_connections as usize)),
            live: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
            faults,
            background: CancellationToken::new(),
            config,
            factory,
        });

        let deadline = Instant::now() + pool.config.connect_timeout;
        let (mut conn, id) = match pool.open(deadline).await {
            Ok(opened) => opened,
            Err(OpenError::Failed(err)) => return Err(DbError::Connect(err)),
            Err(OpenError::NoSlot | OpenError::TimedOut) => {
                return Err(DbError::Connect(pool.open_timeout_error()))
            }
        };

        if let Err(err) = conn.query(PROBE_QUERY, &[]).await {
            warn!(connection_id = id, error = %err, "Database liveness probe failed");
            pool.close_connection(conn, id).await;
            return Err(DbError::Connect(err));
        }
        debug!(connection_id = id, "Database liveness probe passed");

        let now = Instant::now();
        pool.idle().push_back(IdleConnection {
            conn,
            id,
            uses: 0,
            created_at: now,
            idle_since: now,
        });

        pool.spawn_fault_listener();
        pool.spawn_idle_reaper();

        info!("Database connection pool created successfully");
        Ok(pool)
    }

    /// Leases a connection
    ///
    /// Reuses the most recently returned idle connection, discarding any that
    /// sat idle past `idle_timeout`, and otherwise opens a new one. Waiting
    /// for a slot and opening the connection share one `connect_timeout`
    /// deadline.
    ///
    /// # Errors
    ///
    /// - [`DbError::PoolClosed`] after [`ConnectionPool::shutdown`]
    /// - [`DbError::PoolTimeout`] if no connection is ready within `connect_timeout`
    /// - [`DbError::Connect`] if the backend refuses a new connection
    pub async fn acquire(self: &Arc<Self>) -> DbResult<PooledConnection> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let start = Instant::now();
        let deadline = start + self.config.connect_timeout;
        let permit = match timeout_at(deadline, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolClosed),
            Err(_) => return Err(self.timed_out(start)),
        };

        // Shutdown may have started while we were queued
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        loop {
            let next = self.idle().pop_back();
            if let Some(entry) = next {
                if self.is_idle_expired(&entry) {
                    self.retire(entry.conn, entry.id, RetireReason::IdleTimeout)
                        .await;
                    continue;
                }
                return Ok(self.lease(entry.conn, entry.id, entry.uses, entry.created_at, permit));
            }

            match self.open(deadline).await {
                Ok((conn, id)) => return Ok(self.lease(conn, id, 0, Instant::now(), permit)),
                Err(OpenError::Failed(err)) => return Err(DbError::Connect(err)),
                Err(OpenError::TimedOut) => return Err(self.timed_out(start)),
                // A full live count with our permit held means a connection
                // reached the idle set since we looked
                Err(OpenError::NoSlot) => {
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(start));
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Returns a leased connection
    ///
    /// The connection goes back to the idle set unless the pool is closing
    /// (closed), it is flagged broken, or it reached `max_uses` (retired, with
    /// a replacement opened in the background).
    pub async fn release(&self, mut lease: PooledConnection) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&lease.pool)));

        let (Some(conn), permit) = (lease.conn.take(), lease.permit.take()) else {
            return;
        };
        self.leased.fetch_sub(1, Ordering::AcqRel);

        let held_ms = lease.acquired_at.elapsed().as_millis() as u64;

        if self.is_closed() {
            self.retire(conn, lease.id, RetireReason::Shutdown).await;
        } else if lease.broken {
            self.retire(conn, lease.id, RetireReason::Broken).await;
            drop(permit);
            lease.pool.clone().spawn_replacement();
            return;
        } else if lease.uses >= self.config.max_uses {
            self.retire(conn, lease.id, RetireReason::MaxUses).await;
            drop(permit);
            lease.pool.clone().spawn_replacement();
            return;
        } else {
            self.idle().push_back(IdleConnection {
                conn,
                id: lease.id,
                uses: lease.uses,
                created_at: lease.created_at,
                idle_since: Instant::now(),
            });
            debug!(connection_id = lease.id, held_ms, "Released database connection");
        }

        // The slot frees only after the connection is back in the idle set
        drop(permit);
    }

    /// Reclaims expired idle connections and health-checks the rest
    ///
    /// Runs periodically in the background; exposed for callers that want to
    /// force a sweep. Dead connections are discarded and reported as
    /// [`PoolFault::IdleConnectionLost`].
    pub async fn reap_idle(&self) {
        if self.is_closed() {
            return;
        }

        let expired: Vec<IdleConnection> = {
            let mut idle = self.idle();
            let (expired, fresh): (Vec<_>, Vec<_>) =
                idle.drain(..).partition(|entry| self.is_idle_expired(entry));
            idle.extend(fresh);
            expired
        };

        for entry in expired {
            self.retire(entry.conn, entry.id, RetireReason::IdleTimeout)
                .await;
        }

        // A connection being pinged holds a slot, one at a time
        let to_check = self.idle().len();
        let mut checked = Vec::with_capacity(to_check);

        for _ in 0..to_check {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let next = {
                let mut idle = self.idle();
                let pos = idle.iter().position(|entry| !checked.contains(&entry.id));
                pos.and_then(|pos| idle.remove(pos))
            };
            let Some(mut entry) = next else { break };
            checked.push(entry.id);

            match entry.conn.ping().await {
                Ok(()) => {
                    let mut idle = self.idle();
                    // Keep the set ordered by return time
                    let pos = idle.partition_point(|other| other.idle_since <= entry.idle_since);
                    idle.insert(pos, entry);
                }
                Err(err) => {
                    warn!(connection_id = entry.id, error = %err, "Idle connection failed health check");
                    self.emit(PoolFault::IdleConnectionLost {
                        connection_id: entry.id,
                        error: err.to_string(),
                    });
                    self.retire(entry.conn, entry.id, RetireReason::FailedPing)
                        .await;
                }
            }

            drop(permit);
        }
    }

    /// Closes the pool
    ///
    /// New `acquire` calls fail with [`DbError::PoolClosed`] immediately. Leased
    /// connections are closed as their holders release them; once every lease
    /// is back, idle connections are closed. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(
            leased = self.leased.load(Ordering::Acquire),
            "Shutting down database connection pool"
        );
        self.background.cancel();

        // Wait for every outstanding lease to be released
        if let Ok(all) = self
            .semaphore
            .acquire_many(self.config.max_connections)
            .await
        {
            all.forget();
        }

        let drained: Vec<IdleConnection> = self.idle().drain(..).collect();
        for entry in drained {
            self.retire(entry.conn, entry.id, RetireReason::Shutdown)
                .await;
        }

        self.semaphore.close();
        info!("Database connection pool closed");
    }

    /// Subscribes to asynchronous pool faults
    pub fn subscribe(&self) -> broadcast::Receiver<PoolFault> {
        self.faults.subscribe()
    }

    /// Whether [`ConnectionPool::shutdown`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_connections: self.config.max_connections as usize,
            size: self.live.load(Ordering::Acquire),
            idle: self.idle().len(),
            leased: self.leased.load(Ordering::Acquire),
            connections_opened: self.counters.opened.load(Ordering::Relaxed),
            connections_closed: self.counters.closed.load(Ordering::Relaxed),
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle_expired(&self, entry: &IdleConnection) -> bool {
        !self.config.idle_timeout.is_zero() && entry.idle_since.elapsed() >= self.config.idle_timeout
    }

    fn lease(
        self: &Arc<Self>,
        conn: Box<dyn Connection>,
        id: u64,
        uses: u64,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        self.leased.fetch_add(1, Ordering::AcqRel);
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, uses, "Acquired database connection");

        PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: self.clone(),
            id,
            uses,
            created_at,
            acquired_at: Instant::now(),
            broken: false,
        }
    }

    fn timed_out(&self, start: Instant) -> DbError {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        let waited = start.elapsed();
        warn!(
            waited_ms = waited.as_millis() as u64,
            max_connections = self.config.max_connections,
            "Timed out waiting for a database connection"
        );
        DbError::PoolTimeout { waited }
    }

    fn open_timeout_error(&self) -> BackendError {
        BackendError::Connection(format!(
            "timed out after {}ms opening connection",
            self.config.connect_timeout.as_millis()
        ))
    }

    /// Claims a slot in the live count if one is free
    fn reserve_slot(&self) -> Option<SlotReservation<'_>> {
        let max = self.config.max_connections as usize;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .ok()
            .map(|_| SlotReservation {
                live: &self.live,
                committed: false,
            })
    }

    /// Opens a connection in a reserved slot, giving up at `deadline`
    ///
    /// The slot is given back if the open fails, times out, or is cancelled.
    async fn open(&self, deadline: Instant) -> Result<(Box<dyn Connection>, u64), OpenError> {
        let reservation = self.reserve_slot().ok_or(OpenError::NoSlot)?;

        let conn = match timeout_at(deadline, self.factory.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                warn!(error = %err, "Failed to open database connection");
                return Err(OpenError::Failed(err));
            }
            Err(_) => {
                warn!(
                    connect_timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Timed out opening database connection"
                );
                return Err(OpenError::TimedOut);
            }
        };

        reservation.commit();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, "Opened database connection");

        Ok((conn, id))
    }

    async fn retire(&self, conn: Box<dyn Connection>, id: u64, reason: RetireReason) {
        if reason != RetireReason::Shutdown {
            self.counters.retired.fetch_add(1, Ordering::Relaxed);
        }
        debug!(connection_id = id, reason = ?reason, "Retiring database connection");
        self.close_connection(conn, id).await;
    }

    async fn close_connection(&self, conn: Box<dyn Connection>, id: u64) {
        // Counted as gone before the await; a cancelled close drops the connection anyway
        self.forget_connection();
        if let Err(err) = conn.close().await {
            self.emit(PoolFault::CloseFailed {
                connection_id: id,
                error: err.to_string(),
            });
        }
    }

    fn forget_connection(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn emit(&self, fault: PoolFault) {
        // No receivers is fine: the listener is gone only after shutdown
        let _ = self.faults.send(fault);
    }

    /// Opens a connection for the idle set if the pool is below `max_connections`
    fn spawn_replacement(self: Arc<Self>) {
        if self.is_closed() {
            return;
        }

        tokio::spawn(async move {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                return;
            };
            if self.is_closed() {
                return;
            }

            let deadline = Instant::now() + self.config.connect_timeout;
            match self.open(deadline).await {
                Ok((conn, id)) => {
                    let now = Instant::now();
                    self.idle().push_back(IdleConnection {
                        conn,
                        id,
                        uses: 0,
                        created_at: now,
                        idle_since: now,
                    });
                    debug!(connection_id = id, "Opened replacement connection");
                }
                Err(OpenError::NoSlot) => {
                    debug!("Pool is full, skipping replacement connection");
                }
                Err(OpenError::TimedOut) => self.emit(PoolFault::ReplacementFailed {
                    error: self.open_timeout_error().to_string(),
                }),
                Err(OpenError::Failed(err)) => self.emit(PoolFault::ReplacementFailed {
                    error: err.to_string(),
                }),
            }

            drop(permit);
        });
    }

    /// Logs every fault until shutdown
    fn spawn_fault_listener(&self) {
        let mut faults = self.faults.subscribe();
        let cancel = self.background.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    fault = faults.recv() => match fault {
                        Ok(fault) => error!(fault = %fault, "Database pool fault"),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Database pool fault listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_idle_reaper(self: &Arc<Self>) {
        if self.config.idle_timeout.is_zero() {
            return;
        }

        let period = (self.config.idle_timeout / 2).max(MIN_REAP_INTERVAL);
        let pool: Weak<Self> = Arc::downgrade(self);
        let cancel = self.background.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.reap_idle().await;
                    }
                }
            }
        });
    }

    /// Discards the connection of a lease dropped without release
    fn abandon(self: Arc<Self>, conn: Box<dyn Connection>, id: u64) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        warn!(connection_id = id, "Connection lease dropped without release; discarding connection");

        // The live slot frees before the lease's permit does
        self.forget_connection();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = conn.close().await {
                    self.emit(PoolFault::CloseFailed {
                        connection_id: id,
                        error: err.to_string(),
                    });
                }
            });
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// A connection leased from the pool
///
/// Exclusively owned by one caller until handed back with
/// [`ConnectionPool::release`] (or [`PooledConnection::release`]). Dropping it
/// instead (for example when the owning future is cancelled mid-query)
/// discards the connection, since its protocol state is unknown, and frees
/// the slot.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool>,
    id: u64,
    uses: u64,
    created_at: Instant,
    acquired_at: Instant,
    broken: bool,
}

impl PooledConnection {
    /// Runs one statement on this connection
    ///
    /// Counts toward `max_uses`. A connection-level failure flags the lease
    /// broken so the connection is retired on release.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<StatementOutput, BackendError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| BackendError::Connection("connection already released".to_string()))?;

        self.uses += 1;
        let result = conn.query(sql, params).await;

        if let Err(err) = &result {
            if err.is_connection_error() {
                self.broken = true;
            }
        }

        result
    }

    /// Hands the connection back to its pool
    pub async fn release(self) {
        let pool = self.pool.clone();
        pool.release(self).await;
    }

    /// Flags the connection so it is retired instead of reused
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Pool-assigned connection id (stable across leases)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Statements executed on this connection since it was opened
    pub fn uses(&self) -> u64 {
        self.uses
    }

    /// Age of the underlying connection
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("uses", &self.uses)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.clone().abandon(conn, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::mock::MockFactory;
    use std::collections::HashSet;

    fn config(max: u32, connect_timeout_ms: u64) -> Arc<PoolConfig> {
        Arc::new(
            PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
                .with_max_connections(max)
                .with_connect_timeout(Duration::from_millis(connect_timeout_ms)),
        )
    }

    async fn pool_with(config: Arc<PoolConfig>) -> (Arc<ConnectionPool>, MockFactory) {
        let factory = MockFactory::new();
        let pool = ConnectionPool::connect(config, Arc::new(factory.clone()))
            .await
            .expect("pool should start");
        (pool, factory)
    }

    #[tokio::test]
    async fn test_connect_runs_probe_and_keeps_connection_idle() {
        let (pool, factory) = pool_with(config(5, 100)).await;

        assert_eq!(factory.connects(), 1);
        assert_eq!(factory.statements(), 1);

        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    async fn test_connect_fails_when_backend_unreachable() {
        let factory = MockFactory::new();
        factory.refuse_connections(true);

        let result = ConnectionPool::connect(config(2, 100), Arc::new(factory)).await;
        assert!(matches!(result, Err(DbError::Connect(_))));
    }

    #[tokio::test]
    async fn test_idle_connection_reused() {
        let (pool, factory) = pool_with(config(5, 100)).await;

        for _ in 0..5 {
            let conn = pool.acquire().await.unwrap();
            pool.release(conn).await;
        }

        assert_eq!(factory.connects(), 1);
        assert_eq!(pool.stats().acquisitions, 5);
    }

    #[tokio::test]
    async fn test_no_blocking_below_max() {
        let (pool, _factory) = pool_with(config(4, 50)).await;

        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire().await.expect("below max must not block"));
        }

        let ids: HashSet<u64> = leases.iter().map(|l| l.id()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(pool.stats().leased, 4);

        for lease in leases {
            lease.release().await;
        }
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().idle, 4);
    }

    #[tokio::test]
    async fn test_timeout_when_saturated_leaves_counts_unchanged() {
        let (pool, _factory) = pool_with(config(2, 50)).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let before = pool.stats();

        let start = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));

        let after = pool.stats();
        assert_eq!(after.leased, before.leased);
        assert_eq!(after.size, before.size);
        assert_eq!(after.timeouts, 1);

        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (pool, _factory) = pool_with(config(1, 1_000)).await;

        let held = pool.acquire().await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await;

        let lease = waiter.await.unwrap().expect("waiter should get the released connection");
        assert_eq!(lease.id(), held_id);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_max_uses_retires_and_replaces() {
        let config = Arc::new(
            PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
                .with_max_connections(2)
                .with_max_uses(2),
        );
        let (pool, factory) = pool_with(config).await;

        let mut conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        conn.query("SELECT 1", &[]).await.unwrap();
        conn.query("SELECT 1", &[]).await.unwrap();
        pool.release(conn).await;

        assert_eq!(pool.stats().retired, 1);
        assert_eq!(factory.closes(), 1);

        // Replacement is opened in the background
        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first_id);
        assert_eq!(conn.uses(), 0);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_broken_connection_not_reused() {
        let (pool, _factory) = pool_with(config(2, 100)).await;

        let mut conn = pool.acquire().await.unwrap();
        let broken_id = conn.id();
        let err = conn.query("DISCONNECT", &[]).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(conn.is_broken());
        conn.release().await;

        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), broken_id);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot() {
        let (pool, factory) = pool_with(config(1, 50)).await;

        let conn = pool.acquire().await.unwrap();
        drop(conn);

        let conn = pool.acquire().await.expect("slot must be free after drop");
        assert_eq!(pool.stats().leased, 1);
        conn.release().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(factory.closes(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires() {
        let (pool, factory) = pool_with(config(2, 100)).await;

        pool.shutdown().await;

        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
        assert_eq!(factory.closes(), 1);
        assert_eq!(pool.stats().size, 0);

        // Idempotent
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_outstanding_lease() {
        let (pool, factory) = pool_with(config(2, 100)).await;
        let lease = pool.acquire().await.unwrap();

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());
        assert!(pool.is_closed());

        lease.release().await;
        shutdown.await.unwrap();

        assert_eq!(factory.closes(), 1);
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_reclaims_connections() {
        let config = Arc::new(
            PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
                .with_idle_timeout(Duration::from_secs(30)),
        );
        let (pool, factory) = pool_with(config).await;
        assert_eq!(pool.stats().idle, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        pool.reap_idle().await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().retired, 1);
        assert_eq!(factory.closes(), 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_reported_not_raised() {
        let (pool, factory) = pool_with(config(2, 100)).await;
        let mut faults = pool.subscribe();

        factory.kill_connections();
        pool.reap_idle().await;

        match faults.recv().await.unwrap() {
            PoolFault::IdleConnectionLost { connection_id, .. } => assert_eq!(connection_id, 1),
            other => panic!("unexpected fault: {other:?}"),
        }
        assert_eq!(pool.stats().idle, 0);

        // Callers still get a working connection
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), 1);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_replacement_never_exceeds_max() {
        let config = Arc::new(
            PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
                .with_max_connections(1)
                .with_max_uses(1),
        );
        let (pool, _factory) = pool_with(config).await;

        // Retired on release; a replacement is queued in the background
        let mut conn = pool.acquire().await.unwrap();
        conn.query("SELECT 1", &[]).await.unwrap();
        conn.release().await;

        // Opens its own connection before the replacement task runs
        let conn = pool.acquire().await.unwrap();
        conn.release().await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = pool.stats();
        assert_eq!(stats.size, 1, "pool holds {} live connections with max=1", stats.size);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_deadline_covers_connection_open() {
        let (pool, factory) = pool_with(config(1, 100)).await;
        factory.set_connect_delay(Duration::from_millis(90));

        let mut held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let result = pool.acquire().await;
                (result, start.elapsed())
            })
        };

        // The waiter gets the slot at 80ms and must open a new connection
        tokio::time::sleep(Duration::from_millis(80)).await;
        held.mark_broken();
        held.release().await;

        let (result, elapsed) = waiter.await.unwrap();
        assert!(matches!(result, Err(DbError::PoolTimeout { .. })));
        assert!(
            elapsed <= Duration::from_millis(110),
            "acquire took {:?} with connect_timeout=100ms",
            elapsed
        );
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.stats().size, 0, "abandoned open must give its slot back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_holds_one_slot_at_a_time() {
        let config = Arc::new(
            PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
                .with_max_connections(2)
                .with_connect_timeout(Duration::from_millis(20)),
        );
        let (pool, factory) = pool_with(config).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        a.release().await;
        b.release().await;
        assert_eq!(pool.stats().idle, 2);

        factory.set_ping_delay(Duration::from_millis(50));
        let sweep = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reap_idle().await })
        };

        // First ping done, second in flight
        tokio::time::sleep(Duration::from_millis(60)).await;
        let conn = pool
            .acquire()
            .await
            .expect("a checked connection must be leasable during the sweep");
        conn.release().await;

        sweep.await.unwrap();
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_close_does_not_leak_live_count() {
        let (pool, factory) = pool_with(config(2, 100)).await;
        assert_eq!(pool.stats().size, 1);

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        factory.set_close_delay(Duration::from_millis(50));

        // Cancelled while the broken connection is being closed
        let result = tokio::time::timeout(Duration::from_millis(10), conn.release()).await;
        assert!(result.is_err());

        assert_eq!(pool.stats().size, 0);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_live_slot_immediately() {
        let (pool, _factory) = pool_with(config(1, 50)).await;

        let conn = pool.acquire().await.unwrap();
        drop(conn);

        assert_eq!(pool.stats().size, 0);
        assert_eq!(pool.stats().leased, 0);
    }
}
