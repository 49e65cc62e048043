/// Process-scoped database handle
///
/// A [`Database`] is created once at startup and cloned into every consumer
/// (repositories, request handlers, background jobs). It owns the lifecycle of
/// the single [`ConnectionPool`]:
///
/// - [`Database::new`] is cheap and opens nothing
/// - [`Database::init`] creates the pool exactly once, even under concurrent
///   first calls (a `tokio::sync::OnceCell` serializes them)
/// - [`Database::shutdown`] drains and closes the pool at process teardown
///
/// Query and transaction operations live in [`crate::db::executor`] and
/// [`crate::db::transaction`].
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
///     assert!(db.is_healthy());
///
///     db.shutdown().await;
///     Ok(())
/// }
/// ```

use crate::db::backend::postgres::PgConnectionFactory;
use crate::db::backend::ConnectionFactory;
use crate::db::config::PoolConfig;
use crate::db::error::{DbError, DbResult};
use crate::db::pool::{ConnectionPool, PoolFault, PoolStats};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell};
use tracing::{info, warn};

/// Shared handle to the process's connection pool
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    config: Arc<PoolConfig>,
    factory: Arc<dyn ConnectionFactory>,
    pool: OnceCell<Arc<ConnectionPool>>,
    shut_down: AtomicBool,
}

impl Database {
    /// Creates an uninitialized handle
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                config: Arc::new(config),
                factory,
                pool: OnceCell::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Creates an uninitialized handle backed by PostgreSQL
    pub fn postgres(config: PoolConfig) -> Self {
        let factory = Arc::new(PgConnectionFactory::new(&config));
        Self::new(config, factory)
    }

    /// Creates the pool if it does not exist yet
    ///
    /// Idempotent. Concurrent first callers wait for the one initialization in
    /// progress and share its pool. A failed initialization leaves the handle
    /// uninitialized, so a later call retries.
    ///
    /// # Errors
    ///
    /// - [`DbError::PoolClosed`] after [`Database::shutdown`]
    /// - [`DbError::Connect`] if the backing store is unreachable or the
    ///   liveness probe fails
    pub async fn init(&self) -> DbResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }

        let pool = self
            .inner
            .pool
            .get_or_try_init(|| {
                ConnectionPool::connect(self.inner.config.clone(), self.inner.factory.clone())
            })
            .await?;

        // Shutdown raced with the first initialization
        if self.inner.shut_down.load(Ordering::Acquire) {
            pool.shutdown().await;
            return Err(DbError::PoolClosed);
        }

        Ok(())
    }

    /// The initialized pool
    ///
    /// # Errors
    ///
    /// - [`DbError::NotInitialized`] before [`Database::init`] succeeded
    pub fn pool(&self) -> DbResult<Arc<ConnectionPool>> {
        self.inner
            .pool
            .get()
            .cloned()
            .ok_or(DbError::NotInitialized)
    }

    /// Whether the pool exists and has not been shut down
    ///
    /// For liveness checks only; it does not probe the backing store.
    pub fn is_healthy(&self) -> bool {
        self.inner
            .pool
            .get()
            .map(|pool| !pool.is_closed())
            .unwrap_or(false)
    }

    /// Drains and closes the pool
    ///
    /// Waits for leased connections to be released, then closes every
    /// connection. Later `init` calls and queries fail with
    /// [`DbError::PoolClosed`]. A no-op if the pool was never created.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.inner.pool.get() {
            Some(pool) => pool.shutdown().await,
            None => warn!("Database shutdown requested before initialization"),
        }

        info!("Database shut down");
    }

    /// Pool statistics, once initialized
    pub fn stats(&self) -> Option<PoolStats> {
        self.inner.pool.get().map(|pool| pool.stats())
    }

    /// Subscribes to asynchronous pool faults
    pub fn subscribe(&self) -> DbResult<broadcast::Receiver<PoolFault>> {
        Ok(self.pool()?.subscribe())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.inner.factory.name())
            .field("target", &self.inner.config.target())
            .field("initialized", &self.inner.pool.initialized())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Acquire))
            .finish()
    }
}
