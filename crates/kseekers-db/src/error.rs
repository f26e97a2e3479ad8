//! Error types for the database access layer.

use std::time::Duration;

use rusqlite::types::FromSqlError;
use thiserror::Error;

/// Errors that can occur while talking to the database.
#[derive(Debug, Error)]
pub enum DbError {
    /// Pool settings were rejected before any connection was opened.
    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    /// Failed to build the connection pool (one or more connections could
    /// not be established).
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[source] r2d2::Error),

    /// No connection became available before the wait bound expired.
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    AcquireTimeout {
        /// How long the caller was willing to wait.
        waited: Duration,
        /// The pool's report of the failure.
        #[source]
        source: r2d2::Error,
    },

    /// The caller's deadline had already passed and no connection was idle.
    #[error("acquire deadline already expired and no connection was idle")]
    DeadlineExpired,

    /// A statement failed to prepare or execute.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A result row has no column with the requested name.
    #[error("no column named '{0}' in result row")]
    NoSuchColumn(String),

    /// A column value could not be converted to the requested type.
    #[error("column '{column}' could not be decoded: {source}")]
    Column {
        /// Name of the offending column.
        column: String,
        /// The conversion failure.
        #[source]
        source: FromSqlError,
    },
}
