//! Scoped transactions spanning several statements on one connection.

use rusqlite::{Connection, Params};

use crate::error::DbError;
use crate::pool::PooledConnection;
use crate::row::{fetch_all, fetch_map, Row};

/// A pooled connection with an open `IMMEDIATE` transaction.
///
/// Call [`commit`] to make the work durable. A scope that goes out of scope
/// without being committed (early return, `?`, panic) is rolled back. In
/// every case the connection goes back to the pool exactly once, when the
/// scope is dropped.
///
/// [`commit`]: TransactionScope::commit
pub struct TransactionScope {
    conn: PooledConnection,
    finished: bool,
}

impl TransactionScope {
    pub(crate) fn begin(conn: PooledConnection) -> Result<Self, DbError> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        tracing::trace!("transaction scope opened");
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// The underlying connection, for statements not covered by the helpers.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Executes one statement and returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the statement fails. The transaction
    /// stays open; the caller decides whether to roll back.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Executes an insert and returns the rowid it generated.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the statement fails.
    pub fn insert<P: Params>(&self, sql: &str, params: P) -> Result<i64, DbError> {
        self.conn.execute(sql, params)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Runs a read and collects every row.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the query fails.
    pub fn query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Row>, DbError> {
        fetch_all(&self.conn, sql, params)
    }

    /// Runs a read, mapping each row with `f`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the query or the mapping fails.
    pub fn query_map<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>, DbError>
    where
        P: Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        fetch_map(&self.conn, sql, params, f)
    }

    /// Executes a batch of parameterless statements.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` at the first failing statement.
    pub fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Commits the transaction and releases the connection.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the commit fails; the transaction is
    /// then rolled back as the scope drops.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        tracing::trace!("transaction scope committed");
        Ok(())
    }

    /// Rolls the transaction back and releases the connection.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the rollback fails. The pool still
    /// cleans the connection up when it is released.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        tracing::debug!("transaction scope rolled back");
        Ok(())
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.finished || self.conn.is_autocommit() {
            return;
        }
        tracing::warn!("transaction scope dropped without commit, rolling back");
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::error!(error = %e, "rollback of abandoned transaction failed");
        }
    }
}
