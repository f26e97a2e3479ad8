//! The database manager every consumer goes through.
//!
//! [`DbManager`] owns the connection pool and exposes single-call helpers
//! (`execute_query`, `execute_update`, `execute_insert`, `execute_many`) plus
//! scoped transactions. Each helper checks a connection out, runs its
//! statement, and hands the connection back on every exit path. Writes run
//! in their own transaction: commit on success, explicit rollback and
//! re-raise on failure.

use std::fmt::Display;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rusqlite::{Params, TransactionBehavior};

use crate::error::DbError;
use crate::pool::{ConnectionPool, PoolSettings, PooledConnection};
use crate::row::{fetch_all, fetch_map, Row};
use crate::transaction::TransactionScope;

static INSTANCE: OnceCell<DbManager> = OnceCell::new();

/// Shared handle to the connection pool. Cloning is cheap; all clones use
/// the same pool.
#[derive(Debug, Clone)]
pub struct DbManager {
    pool: Arc<ConnectionPool>,
}

impl DbManager {
    /// Wraps an already constructed pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Builds a pool over `db_path` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns the pool construction error unchanged.
    pub fn connect(db_path: &str, settings: PoolSettings) -> Result<Self, DbError> {
        ConnectionPool::new(db_path, settings).map(Self::new)
    }

    /// Returns the process-wide manager, building it on first use.
    ///
    /// Concurrent first callers block until one of them has built the pool;
    /// exactly one pool is ever created. Arguments passed after the first
    /// successful call are ignored. Prefer constructing a manager explicitly
    /// and passing it down; this exists for call sites that cannot take one.
    ///
    /// # Errors
    ///
    /// Returns the pool construction error. A failed first call leaves the
    /// instance unset so a later call can retry.
    pub fn get_instance(db_path: &str, settings: PoolSettings) -> Result<&'static Self, DbError> {
        INSTANCE.get_or_try_init(|| {
            tracing::info!(path = db_path, "creating process-wide database manager");
            Self::connect(db_path, settings)
        })
    }

    /// The pool behind this manager.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs a read and returns every row.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if no connection is available in
    /// time and `DbError::Sqlite` if the query fails.
    pub fn execute_query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Row>, DbError> {
        let conn = self.pool.acquire()?;
        fetch_all(&conn, sql, params).inspect_err(|e| {
            tracing::error!(error = %e, sql, "error executing query");
        })
    }

    /// Runs a read, mapping each row with `f`.
    ///
    /// # Errors
    ///
    /// Same as [`execute_query`](Self::execute_query), plus any error `f`
    /// returns.
    pub fn query_map<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>, DbError>
    where
        P: Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.pool.acquire()?;
        fetch_map(&conn, sql, params, f).inspect_err(|e| {
            tracing::error!(error = %e, sql, "error executing query");
        })
    }

    /// Executes one write in its own transaction and returns the number of
    /// affected rows.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the statement or commit fails; nothing
    /// the statement did is persisted.
    pub fn execute_update<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        self.write("update", sql, |tx| Ok(tx.execute(sql, params)?))
    }

    /// Executes an insert in its own transaction and returns the rowid it
    /// generated.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the statement or commit fails; nothing
    /// is persisted.
    pub fn execute_insert<P: Params>(&self, sql: &str, params: P) -> Result<i64, DbError> {
        self.write("insert", sql, |tx| {
            tx.execute(sql, params)?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Executes the same statement once per parameter set, all under one
    /// commit, and returns the total number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` at the first failing execution; none of the
    /// batch is persisted.
    pub fn execute_many<I, P>(&self, sql: &str, params_list: I) -> Result<usize, DbError>
    where
        I: IntoIterator<Item = P>,
        P: Params,
    {
        self.write("batch", sql, |tx| {
            let mut stmt = tx.prepare(sql)?;
            let mut affected = 0;
            for params in params_list {
                affected += stmt.execute(params)?;
            }
            Ok(affected)
        })
    }

    /// Checks out a connection and opens a transaction on it.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if no connection is available in
    /// time and `DbError::Sqlite` if the transaction cannot begin.
    pub fn transaction(&self) -> Result<TransactionScope, DbError> {
        let conn = self.pool.acquire()?;
        TransactionScope::begin(conn)
    }

    /// Runs `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back and logs when it returns
    /// `Err`, and rolls back if `f` panics. The error from `f` is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or a `DbError` converted into `E` if the
    /// transaction cannot be opened or committed.
    pub fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&TransactionScope) -> Result<T, E>,
        E: From<DbError> + Display,
    {
        let scope = self.transaction()?;
        match f(&scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(e) => {
                tracing::error!(error = %e, "error in database transaction, rolling back");
                if let Err(rollback_err) = scope.rollback() {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Closes the pool if this is the last handle to it.
    ///
    /// Returns `false` when other clones are still alive; the pool then
    /// closes when the last of them drops.
    pub fn shutdown(self) -> bool {
        match Arc::try_unwrap(self.pool) {
            Ok(pool) => {
                pool.close_all();
                true
            }
            Err(_) => {
                tracing::warn!("database manager still shared, deferring pool shutdown");
                false
            }
        }
    }

    fn write<T, F>(&self, op: &'static str, sql: &str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DbError>,
    {
        let mut conn: PooledConnection = self.pool.acquire()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().inspect_err(|e| {
                    tracing::error!(error = %e, op, sql, "commit failed");
                })?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(error = %rollback_err, op, "rollback failed");
                }
                tracing::error!(error = %e, op, sql, "error executing statement, rolled back");
                Err(e)
            }
        }
    }
}
