//! File-based SQL migration engine.
//!
//! Forward scripts live in a directory as `{version}_{name}.sql`; optional
//! reverse scripts sit next to them as `R{version}.sql`. Applied versions
//! are tracked in the `schema_migrations` table together with the SHA-256
//! of the script that was run, so later edits to an applied file show up as
//! drift.
//!
//! Every script runs in its own transaction together with its tracking row
//! change: a script either applies completely or leaves no trace. Batches
//! (`migrate_up`, `migrate_down`) stop at the first failure and keep what
//! already completed.

mod error;
mod file;
mod runner;

pub use error::MigrationError;
pub use file::{
    checksum, discover, rollback_file_name, split_statements, MigrationFile, Version,
};
pub use runner::{
    AppliedMigration, ChecksumDrift, MigrationManager, MigrationStatus, BASELINE_VERSION,
    TRACKING_TABLE,
};
