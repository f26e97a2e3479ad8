//! Error types for the migration engine.

use std::path::PathBuf;

use thiserror::Error;

use super::file::Version;
use crate::error::DbError;

/// Errors that can occur while discovering, applying, or rolling back
/// migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration file or directory could not be read or written.
    #[error("migration file error at {}: {source}", .path.display())]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A version string is not a non-empty run of digits.
    #[error("invalid migration version '{0}'")]
    InvalidVersion(String),

    /// A migration name sanitizes to nothing.
    #[error("invalid migration name '{0}'")]
    InvalidName(String),

    /// Two migration files share a version.
    #[error("duplicate migration version {version}: {} and {}", .first.display(), .second.display())]
    DuplicateVersion {
        /// The contested version.
        version: Version,
        /// First file claiming it.
        first: PathBuf,
        /// Second file claiming it.
        second: PathBuf,
    },

    /// A file to be created already exists.
    #[error("refusing to overwrite existing file {}", .0.display())]
    FileExists(PathBuf),

    /// A statement inside a migration or rollback script failed.
    #[error("migration {version} failed at statement {index}: {source}")]
    Statement {
        /// The migration being applied or rolled back.
        version: Version,
        /// One-based position of the statement in the script.
        index: usize,
        /// The database error.
        source: DbError,
    },

    /// No `R{version}.sql` script exists for the requested rollback.
    #[error("rollback script not found for migration {version}: {}", .path.display())]
    MissingRollback {
        /// The migration that was to be rolled back.
        version: Version,
        /// Where the script was expected.
        path: PathBuf,
    },

    /// The requested rollback targets a version that is not applied.
    #[error("migration {0} is not applied")]
    NotApplied(Version),

    /// A batch run stopped at a failing migration. Migrations completed
    /// before it stay as they are.
    #[error("migration batch halted at {version} after {completed} completed: {source}")]
    BatchHalted {
        /// The migration that failed.
        version: Version,
        /// How many migrations of the batch completed before it.
        completed: usize,
        /// Why it failed.
        source: Box<MigrationError>,
    },

    /// Reading or writing migration state failed.
    #[error("migration state error: {0}")]
    Database(#[from] DbError),
}
