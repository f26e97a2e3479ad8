//! Database access layer for the KSeekers backend.
//!
//! Provides a bounded SQLite connection pool (via `r2d2`), the
//! [`DbManager`] facade every other module uses to run SQL, scoped
//! transactions, and a file-based migration engine with versioning,
//! checksums, and rollback scripts.
//!
//! # Design decisions
//!
//! - **Explicit manager, not a global**: a [`DbManager`] is built once at
//!   startup and cloned into whatever needs it. [`DbManager::get_instance`]
//!   exists for call sites that cannot take one, and still builds exactly
//!   one pool per process.
//! - **Bounded waits**: checking a connection out never blocks forever. The
//!   default bound comes from [`PoolSettings::acquire_timeout_ms`]; callers
//!   can pass their own timeout or deadline.
//! - **Clean connections only**: a connection returned with an open
//!   transaction is rolled back before anyone else can check it out, and
//!   discarded if that fails.
//! - **Bound parameters only**: every helper takes `rusqlite::Params`;
//!   values are never spliced into SQL text.
//! - **Halt without undo**: a multi-migration run stops at the first
//!   failing script and leaves earlier scripts applied. Each script is
//!   atomic on its own.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kseekers_db::{DbManager, MigrationManager, PoolSettings};
//!
//! let db = DbManager::connect("kseekers.db", PoolSettings::default())?;
//! MigrationManager::new(db.clone(), "migrations").migrate_up(None)?;
//!
//! let id = db.execute_insert(
//!     "INSERT INTO lookups (category, label) VALUES (?1, ?2)",
//!     ("country", "India"),
//! )?;
//!
//! db.with_transaction(|tx| -> Result<(), kseekers_db::DbError> {
//!     tx.execute("UPDATE lookups SET active = 0 WHERE id = ?1", [id])?;
//!     tx.execute("INSERT INTO audit (lookup_id) VALUES (?1)", [id])?;
//!     Ok(())
//! })?;
//! ```

mod error;
mod manager;
pub mod migrations;
mod pool;
mod row;
mod transaction;

pub use error::DbError;
pub use manager::DbManager;
pub use migrations::{MigrationError, MigrationManager, MigrationStatus, Version};
pub use pool::{CheckedConnectionManager, ConnectionPool, PoolSettings, PoolState, PooledConnection};
pub use row::Row;
pub use transaction::TransactionScope;

// Re-exported so consumers can name parameter and value types without a
// direct rusqlite dependency.
pub use rusqlite::{params, types::Value};
