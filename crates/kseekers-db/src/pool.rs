//! Connection pool creation, checkout, and release.

use std::fmt;
use std::time::{Duration, Instant};

use r2d2::event::{CheckinEvent, CheckoutEvent, HandleEvent, TimeoutEvent};
use r2d2::{HandleError, ManageConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use crate::error::DbError;

/// Runtime tunables for the pool and for each SQLite connection in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of pooled connections.
    pub pool_max_size: u32,

    /// Connections kept open while idle. `None` fills the pool to
    /// `pool_max_size` at construction.
    pub pool_min_idle: Option<u32>,

    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on how long [`ConnectionPool::acquire`] waits, in
    /// milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_max_size: 5,
            pool_min_idle: None,
            busy_timeout_ms: 5_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolSettings {
    fn validate(&self) -> Result<(), DbError> {
        if self.pool_max_size == 0 {
            return Err(DbError::InvalidSettings(
                "pool_max_size must be at least 1".to_string(),
            ));
        }
        if let Some(min_idle) = self.pool_min_idle {
            if min_idle > self.pool_max_size {
                return Err(DbError::InvalidSettings(format!(
                    "pool_min_idle ({min_idle}) exceeds pool_max_size ({})",
                    self.pool_max_size
                )));
            }
        }
        if self.acquire_timeout_ms == 0 {
            return Err(DbError::InvalidSettings(
                "acquire_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured acquire bound as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// A connection checked out of a [`ConnectionPool`]. Dropping it releases
/// it back to the pool.
pub type PooledConnection = r2d2::PooledConnection<CheckedConnectionManager>;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Connections currently open, idle or checked out.
    pub connections: u32,
    /// Connections sitting in the pool, available for checkout.
    pub idle_connections: u32,
}

impl PoolState {
    /// Connections currently held by callers.
    pub fn in_use(&self) -> u32 {
        self.connections - self.idle_connections
    }
}

/// SQLite connection manager that cleans connections up on their way back
/// into the pool.
///
/// A connection released with a transaction still open is rolled back. If
/// that rollback fails the connection is reported broken, and the pool
/// closes it and opens a replacement.
pub struct CheckedConnectionManager {
    inner: SqliteConnectionManager,
}

impl fmt::Debug for CheckedConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedConnectionManager").finish_non_exhaustive()
    }
}

impl ManageConnection for CheckedConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        self.inner.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        self.inner.is_valid(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        if conn.is_autocommit() {
            return false;
        }

        tracing::warn!("connection released with an open transaction, rolling back");
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => false,
            Err(e) => {
                tracing::error!(error = %e, "rollback on release failed, discarding connection");
                true
            }
        }
    }
}

/// Routes pool lifecycle events to `tracing`.
#[derive(Debug)]
struct TracingEventHandler;

impl HandleEvent for TracingEventHandler {
    fn handle_checkout(&self, event: CheckoutEvent) {
        tracing::trace!(
            conn_id = event.connection_id(),
            waited_ms = event.duration().as_millis() as u64,
            "connection checked out"
        );
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        tracing::warn!(
            timeout_ms = event.timeout().as_millis() as u64,
            "timed out waiting for a pooled connection"
        );
    }

    fn handle_checkin(&self, event: CheckinEvent) {
        tracing::trace!(
            conn_id = event.connection_id(),
            held_ms = event.duration().as_millis() as u64,
            "connection checked in"
        );
    }
}

#[derive(Debug)]
struct TracingErrorHandler;

impl HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::error!(error = %error, "database connection error");
    }
}

/// A bounded pool of SQLite connections.
///
/// Each connection is owned by exactly one caller between [`acquire`] and
/// release. The pool never grows past `pool_max_size`.
///
/// [`acquire`]: ConnectionPool::acquire
pub struct ConnectionPool {
    inner: Pool<CheckedConnectionManager>,
    settings: PoolSettings,
    path: String,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionPool {
    /// Opens a pool over the SQLite database at `db_path`.
    ///
    /// Connections are opened with WAL mode and foreign keys enabled. With
    /// `pool_min_idle` unset, all `pool_max_size` connections are opened
    /// before this returns.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file. Use `:memory:` for an
    ///   in-memory database; note that every connection then sees its own
    ///   private database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidSettings` for unusable settings and
    /// `DbError::PoolInit` if the initial connections cannot be established.
    pub fn new(db_path: &str, settings: PoolSettings) -> Result<Self, DbError> {
        settings.validate()?;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let busy_timeout_ms = settings.busy_timeout_ms;
        let sqlite = SqliteConnectionManager::file(db_path)
            .with_flags(flags)
            .with_init(move |conn| {
                // In-memory databases report "memory", which is acceptable.
                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                if journal_mode != "wal" && journal_mode != "memory" {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                        Some(format!(
                            "failed to set WAL journal mode, got: {}",
                            journal_mode
                        )),
                    ));
                }
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = {};",
                    busy_timeout_ms
                ))
            });

        let min_idle = settings.pool_min_idle.unwrap_or(settings.pool_max_size);
        let inner = Pool::builder()
            .max_size(settings.pool_max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(settings.acquire_timeout())
            .event_handler(Box::new(TracingEventHandler))
            .error_handler(Box::new(TracingErrorHandler))
            .build(CheckedConnectionManager { inner: sqlite })
            .map_err(DbError::PoolInit)?;

        tracing::info!(
            path = db_path,
            max_size = settings.pool_max_size,
            min_idle,
            "database connection pool initialized"
        );

        Ok(Self {
            inner,
            settings,
            path: db_path.to_string(),
        })
    }

    /// Checks out a connection, waiting up to the configured
    /// `acquire_timeout_ms`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if no connection frees up in time.
    pub fn acquire(&self) -> Result<PooledConnection, DbError> {
        self.acquire_timeout(self.settings.acquire_timeout())
    }

    /// Checks out a connection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if no connection frees up in time.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection, DbError> {
        tracing::trace!(timeout_ms = timeout.as_millis() as u64, "acquiring connection");
        self.inner
            .get_timeout(timeout)
            .map_err(|source| DbError::AcquireTimeout {
                waited: timeout,
                source,
            })
    }

    /// Checks out a connection, giving up once `deadline` has passed.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if the deadline passes while
    /// waiting, or `DbError::DeadlineExpired` if it had already passed and
    /// no connection was idle.
    pub fn acquire_until(&self, deadline: Instant) -> Result<PooledConnection, DbError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        // An expired deadline still gets one non-blocking attempt.
        if remaining.is_zero() {
            return self.try_acquire().ok_or(DbError::DeadlineExpired);
        }
        self.acquire_timeout(remaining)
    }

    /// Checks out an idle connection without waiting.
    pub fn try_acquire(&self) -> Option<PooledConnection> {
        self.inner.try_get()
    }

    /// Returns a connection to the pool.
    ///
    /// Equivalent to dropping it; any transaction left open is rolled back
    /// on the way in.
    pub fn release(&self, conn: PooledConnection) {
        tracing::trace!("releasing connection back to pool");
        drop(conn);
    }

    /// Current occupancy of the pool.
    pub fn state(&self) -> PoolState {
        let state = self.inner.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Maximum number of connections this pool will hold.
    pub fn max_size(&self) -> u32 {
        self.inner.max_size()
    }

    /// Settings the pool was built with.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Path of the database file behind the pool.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Closes the pool.
    ///
    /// Idle connections are closed immediately. Connections still checked
    /// out are closed as their holders release them.
    pub fn close_all(self) {
        let state = self.state();
        tracing::info!(
            path = %self.path,
            idle = state.idle_connections,
            in_use = state.in_use(),
            "closing database connection pool"
        );
        drop(self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn settings(max_size: u32) -> PoolSettings {
        PoolSettings {
            pool_max_size: max_size,
            acquire_timeout_ms: 10_000,
            ..PoolSettings::default()
        }
    }

    fn file_pool(dir: &tempfile::TempDir, max_size: u32) -> ConnectionPool {
        let path = dir.path().join("pool.db");
        ConnectionPool::new(path.to_str().expect("utf-8 path"), settings(max_size))
            .expect("pool creation should succeed")
    }

    #[test]
    fn create_in_memory_pool() {
        let settings = PoolSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
            ..PoolSettings::default()
        };

        let pool = ConnectionPool::new(":memory:", settings).expect("pool creation should succeed");
        let conn = pool.acquire().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert!(
            mode == "wal" || mode == "memory",
            "unexpected journal_mode: {mode}"
        );

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");

        assert_eq!(pool.max_size(), 3, "pool max size should match settings");
    }

    #[test]
    fn pool_is_filled_eagerly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 4);

        let state = pool.state();
        assert_eq!(state.connections, 4);
        assert_eq!(state.idle_connections, 4);
        assert_eq!(state.in_use(), 0);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let zero = PoolSettings {
            pool_max_size: 0,
            ..PoolSettings::default()
        };
        assert!(matches!(
            ConnectionPool::new(":memory:", zero),
            Err(DbError::InvalidSettings(_))
        ));

        let min_over_max = PoolSettings {
            pool_max_size: 2,
            pool_min_idle: Some(3),
            ..PoolSettings::default()
        };
        assert!(matches!(
            ConnectionPool::new(":memory:", min_over_max),
            Err(DbError::InvalidSettings(_))
        ));

        let no_wait = PoolSettings {
            acquire_timeout_ms: 0,
            ..PoolSettings::default()
        };
        assert!(matches!(
            ConnectionPool::new(":memory:", no_wait),
            Err(DbError::InvalidSettings(_))
        ));
    }

    #[test]
    fn unopenable_database_fails_construction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("nested").join("db.sqlite");
        let settings = PoolSettings {
            pool_max_size: 1,
            acquire_timeout_ms: 200,
            ..PoolSettings::default()
        };

        let result = ConnectionPool::new(path.to_str().expect("utf-8 path"), settings);
        assert!(matches!(result, Err(DbError::PoolInit(_))));
    }

    #[test]
    fn acquire_up_to_max_size_does_not_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 3);

        let held: Vec<_> = (0..3)
            .map(|_| pool.try_acquire().expect("idle connection should be available"))
            .collect();
        assert_eq!(pool.state().in_use(), 3);
        assert!(pool.try_acquire().is_none(), "pool should be exhausted");

        drop(held);
        assert_eq!(pool.state().idle_connections, 3);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 1);
        let _held = pool.acquire().expect("first acquire");

        let err = pool
            .acquire_timeout(Duration::from_millis(50))
            .expect_err("second acquire should time out");
        match err {
            DbError::AcquireTimeout { waited, .. } => {
                assert_eq!(waited, Duration::from_millis(50))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn expired_deadline_does_not_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 1);

        let conn = pool
            .acquire_until(Instant::now())
            .expect("idle connection should be handed out even at the deadline");
        let err = pool
            .acquire_until(Instant::now())
            .expect_err("exhausted pool with expired deadline should fail");
        assert!(matches!(err, DbError::DeadlineExpired));
        pool.release(conn);
    }

    #[test]
    fn deadline_passing_while_waiting_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 1);
        let _held = pool.acquire().expect("first acquire");

        let started = Instant::now();
        let err = pool
            .acquire_until(started + Duration::from_millis(100))
            .expect_err("exhausted pool should give up at the deadline");
        assert!(matches!(err, DbError::AcquireTimeout { .. }), "unexpected error: {err:?}");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn third_caller_blocks_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = Arc::new(file_pool(&dir, 2));

        let (acquired_tx, acquired_rx) = mpsc::channel::<usize>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let handles: Vec<_> = (0..3)
            .map(|id| {
                let pool = Arc::clone(&pool);
                let acquired_tx = acquired_tx.clone();
                let release_rx = Arc::clone(&release_rx);
                thread::spawn(move || {
                    let conn = pool.acquire().expect("acquire should eventually succeed");
                    acquired_tx.send(id).expect("send acquired");
                    release_rx
                        .lock()
                        .expect("release lock")
                        .recv()
                        .expect("release signal");
                    pool.release(conn);
                })
            })
            .collect();

        for _ in 0..2 {
            acquired_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("two callers should acquire immediately");
        }
        assert!(
            acquired_rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "third caller must wait while the pool is exhausted"
        );

        release_tx.send(()).expect("signal release");
        acquired_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("third caller should unblock after a release");

        release_tx.send(()).expect("signal release");
        release_tx.send(()).expect("signal release");
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let state = pool.state();
        assert_eq!(state.connections, 2);
        assert_eq!(state.idle_connections, 2);
    }

    #[test]
    fn release_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 1);

        {
            let conn = pool.acquire().expect("acquire");
            conn.execute_batch("CREATE TABLE probe (id INTEGER PRIMARY KEY);")
                .expect("create table");
            conn.execute_batch("BEGIN; INSERT INTO probe (id) VALUES (1);")
                .expect("open transaction");
            assert!(!conn.is_autocommit());
            pool.release(conn);
        }

        let conn = pool.acquire().expect("reacquire");
        assert!(conn.is_autocommit(), "released connection should be clean");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM probe", [], |row| row.get(0))
            .expect("count rows");
        assert_eq!(count, 0, "uncommitted insert should have been rolled back");
        assert_eq!(pool.state().connections, 1);
    }

    #[test]
    fn close_all_consumes_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 2);
        assert_eq!(pool.path(), dir.path().join("pool.db").to_str().expect("utf-8"));
        pool.close_all();
    }
}
