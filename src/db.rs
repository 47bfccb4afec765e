use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::error::{PoolError, RepoError};

struct IdleConnection {
    conn: SqliteConnection,
    generation: u64,
}

struct PoolInner {
    options: SqliteConnectOptions,
    idle: Mutex<Vec<IdleConnection>>,
    capacity: usize,
    permits: Arc<Semaphore>,
    max_checked_out: usize,
    acquire_timeout: Duration,
    test_on_acquire: bool,
    generation: AtomicU64,
    closed: AtomicBool,
    #[cfg(test)]
    failing_pings: AtomicUsize,
}

impl PoolInner {
    fn pop_idle(&self) -> Option<IdleConnection> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    /// Puts a connection back on the idle list, or hands it back to the caller
    /// when the list is already full.
    fn push_idle(&self, conn: IdleConnection) -> Option<IdleConnection> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(conn);
            None
        } else {
            Some(conn)
        }
    }

    async fn health_check(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        if self.forced_ping_failure() {
            return Err(sqlx::Error::WorkerCrashed);
        }
        conn.ping().await
    }

    #[cfg(test)]
    fn forced_ping_failure(&self) -> bool {
        self.failing_pings
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn forced_ping_failure(&self) -> bool {
        false
    }

    fn release(&self, conn: SqliteConnection, generation: u64, broken: bool) {
        if broken {
            debug!("dropping connection marked broken");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if generation != self.generation.load(Ordering::Acquire) {
            debug!(generation, "dropping connection from a previous pool generation");
            return;
        }
        if self.push_idle(IdleConnection { conn, generation }).is_some() {
            debug!("idle list full, closing overflow connection");
        }
    }
}

/// Fixed-size pool of SQLite connections.
///
/// At most `pool_size` connections sit idle. Up to `pool_size + max_overflow`
/// may be checked out at once; beyond that `acquire` waits for
/// `acquire_timeout` and then fails with [`PoolError::Exhausted`].
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub in_use: usize,
    pub capacity: usize,
    pub max_checked_out: usize,
}

impl ConnectionPool {
    pub async fn open(config: &DbConfig) -> Result<Self, PoolError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(PoolError::Connect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let capacity = config.pool_size.max(1);
        let max_checked_out = capacity + config.max_overflow;
        let inner = Arc::new(PoolInner {
            options,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            permits: Arc::new(Semaphore::new(max_checked_out)),
            max_checked_out,
            acquire_timeout: config.acquire_timeout(),
            test_on_acquire: config.test_on_acquire,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            #[cfg(test)]
            failing_pings: AtomicUsize::new(0),
        });

        for _ in 0..capacity {
            let conn = inner.options.connect().await.map_err(PoolError::Connect)?;
            inner.push_idle(IdleConnection { conn, generation: 0 });
        }

        info!(capacity, max_checked_out, "connection pool opened");
        Ok(Self { inner })
    }

    /// Checks out a connection. The returned guard gives it back on drop.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let waited = self.inner.acquire_timeout;
        let permit = tokio::time::timeout(waited, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| {
                warn!(?waited, "connection pool exhausted");
                PoolError::Exhausted { waited }
            })?
            .map_err(|_| PoolError::Closed)?;

        let current = self.inner.generation.load(Ordering::Acquire);
        while let Some(mut idle) = self.inner.pop_idle() {
            if idle.generation != current {
                continue;
            }
            if self.inner.test_on_acquire {
                if let Err(e) = self.inner.health_check(&mut idle.conn).await {
                    warn!(error = %e, "idle connection failed health check, discarding");
                    continue;
                }
            }
            return Ok(PooledConnection::new(idle.conn, current, &self.inner, permit));
        }

        let conn = self
            .inner
            .options
            .connect()
            .await
            .map_err(PoolError::Connect)?;
        debug!("opened new store connection");
        Ok(PooledConnection::new(conn, current, &self.inner, permit))
    }

    /// Retires every connection opened so far. Idle ones are dropped now,
    /// checked-out ones when they are released.
    pub fn invalidate(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stale: Vec<_> = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        info!(generation, dropped = stale.len(), "connection pool invalidated");
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStatus {
            idle,
            in_use: self.inner.max_checked_out - self.inner.permits.available_permits(),
            capacity: self.inner.capacity,
            max_checked_out: self.inner.max_checked_out,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops handing out connections and closes the idle ones.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let idle: Vec<_> = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for IdleConnection { conn, .. } in idle {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "error closing idle connection");
            }
        }
        info!("connection pool closed");
    }
}

/// A checked-out connection. Derefs to [`SqliteConnection`].
pub struct PooledConnection {
    conn: Option<SqliteConnection>,
    generation: u64,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(
        conn: SqliteConnection,
        generation: u64,
        pool: &Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            generation,
            broken: false,
            pool: Arc::clone(pool),
            _permit: permit,
        }
    }

    /// Keeps this connection from re-entering the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation, self.broken);
        }
    }
}

/// Applies the embedded schema migrations.
pub async fn migrate(pool: &ConnectionPool) -> Result<(), RepoError> {
    let mut conn = pool.acquire().await?;
    sqlx::migrate!("./migrations")
        .run(&mut *conn)
        .await
        .map_err(|e| RepoError::StoreUnavailable(e.into()))?;
    info!("migrations applied");
    Ok(())
}

/// Runs `fut` with a deadline, naming the operation in the timeout error.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, RepoError>
where
    F: Future<Output = Result<T, RepoError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            warn!(operation, ?limit, "operation timed out");
            Err(RepoError::Timeout { operation })
        }
    }
}

/// Flags the connection when `res` failed at the transport level.
pub(crate) fn track<T>(conn: &mut PooledConnection, res: Result<T, RepoError>) -> Result<T, RepoError> {
    if let Err(e) = &res {
        if e.is_connection_fault() {
            warn!(error = ?e, "connection fault, discarding connection");
            conn.mark_broken();
        }
    }
    res
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn open_prewarms_idle_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 3, 2)).await.unwrap();
        let status = pool.status();
        assert_eq!(status.idle, 3);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.capacity, 3);
        assert_eq!(status.max_checked_out, 5);
    }

    #[tokio::test]
    async fn released_connections_return_to_idle_list() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 2, 0)).await.unwrap();
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.status().idle, 0);
            assert_eq!(pool.status().in_use, 2);
        }
        assert_eq!(pool.status().idle, 2);
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn overflow_connections_are_closed_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 1, 2)).await.unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.status().in_use, 3);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_rejects_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 1, 0)).await.unwrap();
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().expect("second acquire must fail");
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn waiter_gets_connection_released_in_time() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 1, 0)).await.unwrap();
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        waiter.await.unwrap().expect("waiter acquires after release");
    }

    #[tokio::test]
    async fn broken_connections_do_not_reenter_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 1, 0)).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.status().idle, 0);
        // a fresh connection is opened in its place
        let mut conn = pool.acquire().await.unwrap();
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn failed_health_check_replaces_idle_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 1, 0)).await.unwrap();
        {
            // temp tables are private to the connection that created them
            let mut conn = pool.acquire().await.unwrap();
            sqlx::query("CREATE TEMP TABLE marker (x INTEGER)")
                .execute(&mut *conn)
                .await
                .unwrap();
        }
        assert_eq!(pool.status().idle, 1);

        fail_next_pings(&pool, 1);
        let mut conn = pool.acquire().await.unwrap();
        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.in_use, 1);
        conn.ping().await.unwrap();
        let (tables,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'marker'")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(tables, 0, "expected a freshly opened connection");
        drop(conn);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn invalidate_retires_checked_out_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 2, 0)).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        pool.invalidate();
        assert_eq!(pool.status().idle, 0);
        drop(conn);
        assert_eq!(pool.status().idle, 0);
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&db_config(&dir, 2, 0)).await.unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.status().idle, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = migrated_pool(&dir, 1).await;
        migrate(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn bounded_reports_timeout_with_operation_name() {
        let res: Result<(), RepoError> = bounded("slow_op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match res {
            Err(RepoError::Timeout { operation }) => assert_eq!(operation, "slow_op"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
