//! Applying, rolling back, and reporting on migrations.

use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::params;
use serde::Serialize;

use super::error::MigrationError;
use super::file::{
    checksum, discover, read_script, rollback_file_name, split_statements, MigrationFile, Version,
};
use crate::manager::DbManager;
use crate::transaction::TransactionScope;

/// Name of the table recording applied migrations.
pub const TRACKING_TABLE: &str = "schema_migrations";

/// Version given to the first migration created in an empty directory.
pub const BASELINE_VERSION: &str = "01";

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    /// Version of the applied script.
    pub version: Version,
    /// Name recorded when it was applied.
    pub name: String,
    /// When it was applied (`YYYY-MM-DD HH:MM:SS`, UTC).
    pub applied_at: String,
    /// SHA-256 of the script as applied.
    pub checksum: Option<String>,
}

/// An applied migration whose file no longer matches what was run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumDrift {
    /// The drifted version.
    pub version: Version,
    /// Checksum stored when the migration was applied.
    pub recorded: Option<String>,
    /// Checksum of the file on disk now.
    pub current: String,
    /// The file on disk.
    pub path: PathBuf,
}

/// Snapshot of migration state.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Number of applied migrations.
    pub applied_count: usize,
    /// Number of migration files on disk.
    pub available_count: usize,
    /// Number of files not yet applied.
    pub pending_count: usize,
    /// Applied migrations, ascending.
    pub applied: Vec<AppliedMigration>,
    /// Files not yet applied, ascending.
    pub pending: Vec<MigrationFile>,
    /// Applied migrations whose file changed since.
    pub drifted: Vec<ChecksumDrift>,
    /// Applied versions with no file on disk.
    pub missing_files: Vec<Version>,
}

/// Tracks, applies, and rolls back migrations from one directory.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    db: DbManager,
    dir: PathBuf,
}

impl MigrationManager {
    /// Creates a manager for the scripts in `dir`, executing through `db`.
    pub fn new(db: DbManager, dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            dir: dir.into(),
        }
    }

    /// Directory scanned for scripts.
    pub fn migrations_dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the tracking table if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the DDL fails.
    pub fn create_migrations_table(&self) -> Result<(), MigrationError> {
        self.db.execute_update(
            &format!(
                "CREATE TABLE IF NOT EXISTS {TRACKING_TABLE} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    version TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                    checksum TEXT
                )"
            ),
            [],
        )?;
        Ok(())
    }

    fn tracking_table_exists(&self) -> Result<bool, MigrationError> {
        let found = self.db.query_map(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [TRACKING_TABLE],
            |_| Ok(()),
        )?;
        Ok(!found.is_empty())
    }

    /// Migration files on disk, ascending by version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory cannot be read and
    /// `MigrationError::DuplicateVersion` if two files share a version.
    pub fn get_available_migrations(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        discover(&self.dir)
    }

    /// Applied migrations, ascending by version. Empty when the tracking
    /// table does not exist yet; this never creates it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the tracking table cannot be
    /// read.
    pub fn get_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        if !self.tracking_table_exists()? {
            return Ok(Vec::new());
        }

        let mut applied = self.db.query_map(
            &format!("SELECT version, name, applied_at, checksum FROM {TRACKING_TABLE}"),
            [],
            |row| {
                Ok(AppliedMigration {
                    version: Version::recorded(row.get(0)?),
                    name: row.get(1)?,
                    applied_at: row.get(2)?,
                    checksum: row.get(3)?,
                })
            },
        )?;
        applied.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(applied)
    }

    /// Files on disk that are not applied yet, ascending by version.
    ///
    /// # Errors
    ///
    /// Propagates discovery and tracking-table errors.
    pub fn get_pending_migrations(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        let applied = self.get_applied_migrations()?;
        Ok(self
            .get_available_migrations()?
            .into_iter()
            .filter(|m| !is_applied(&applied, &m.version))
            .collect())
    }

    /// Applies one migration: every statement of the script plus its
    /// tracking row, in a single transaction.
    ///
    /// A script with no statements is recorded as applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the script cannot be read,
    /// `MigrationError::Statement` if a statement fails, and
    /// `MigrationError::Database` if the tracking row cannot be written
    /// (for example because the version is already applied). Nothing is
    /// left behind on failure.
    pub fn apply_migration(&self, migration: &MigrationFile) -> Result<(), MigrationError> {
        let content = read_script(&migration.path)?;
        let checksum = checksum(&content);
        let statements = split_statements(&content);
        if statements.is_empty() {
            tracing::warn!(
                version = %migration.version,
                "migration has no statements, recording it as applied"
            );
        }

        self.create_migrations_table()?;

        tracing::info!(
            version = %migration.version,
            name = %migration.name,
            statements = statements.len(),
            "applying migration"
        );

        self.db
            .with_transaction(|tx| -> Result<(), MigrationError> {
                run_statements(tx, &migration.version, &statements)?;
                tx.execute(
                    &format!(
                        "INSERT INTO {TRACKING_TABLE} (version, name, checksum) VALUES (?1, ?2, ?3)"
                    ),
                    params![migration.version.as_str(), migration.name, checksum],
                )?;
                Ok(())
            })
            .inspect_err(|e| {
                tracing::error!(version = %migration.version, error = %e, "failed to apply migration");
            })?;

        tracing::info!(version = %migration.version, "applied migration");
        Ok(())
    }

    /// Rolls back one applied migration by running `R{version}.sql` and
    /// deleting its tracking row, in a single transaction.
    ///
    /// `version` matches the applied migration with the same number, so
    /// `2` rolls back a migration recorded as `02`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::MissingRollback` if no reverse script
    /// exists and `MigrationError::NotApplied` if the version is not
    /// applied; neither touches the database. Statement failures roll the
    /// whole rollback back.
    pub fn rollback_migration(&self, version: &Version) -> Result<(), MigrationError> {
        let recorded = self.recorded_spelling(version)?;
        let version = &recorded;

        let path = self.dir.join(rollback_file_name(version));
        if !path.is_file() {
            tracing::error!(%version, path = %path.display(), "rollback script not found");
            return Err(MigrationError::MissingRollback {
                version: version.clone(),
                path,
            });
        }

        let content = read_script(&path)?;
        let statements = split_statements(&content);

        self.create_migrations_table()?;

        tracing::info!(%version, statements = statements.len(), "rolling back migration");

        self.db
            .with_transaction(|tx| -> Result<(), MigrationError> {
                let recorded = tx.query_map(
                    &format!("SELECT 1 FROM {TRACKING_TABLE} WHERE version = ?1"),
                    [version.as_str()],
                    |_| Ok(()),
                )?;
                if recorded.is_empty() {
                    return Err(MigrationError::NotApplied(version.clone()));
                }

                run_statements(tx, version, &statements)?;
                tx.execute(
                    &format!("DELETE FROM {TRACKING_TABLE} WHERE version = ?1"),
                    [version.as_str()],
                )?;
                Ok(())
            })
            .inspect_err(|e| {
                tracing::error!(%version, error = %e, "failed to roll back migration");
            })?;

        tracing::info!(%version, "rolled back migration");
        Ok(())
    }

    /// The version as written in the tracking table when one with the same
    /// number is applied, otherwise `version` unchanged.
    fn recorded_spelling(&self, version: &Version) -> Result<Version, MigrationError> {
        Ok(self
            .get_applied_migrations()?
            .into_iter()
            .map(|m| m.version)
            .find(|applied| applied.same_number(version))
            .unwrap_or_else(|| version.clone()))
    }

    /// Applies pending migrations in ascending version order, up to and
    /// including `target` when given. Returns how many were applied.
    ///
    /// The run halts at the first failing migration. Migrations applied
    /// earlier in the same run stay applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::BatchHalted` wrapping the first failure, or
    /// the discovery/state error that prevented the run from starting.
    pub fn migrate_up(&self, target: Option<&Version>) -> Result<usize, MigrationError> {
        self.create_migrations_table()?;

        let mut pending = self.get_pending_migrations()?;
        if let Some(target) = target {
            pending.retain(|m| m.version.numeric_cmp(target) != Ordering::Greater);
        }

        if pending.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(0);
        }

        for (completed, migration) in pending.iter().enumerate() {
            if let Err(e) = self.apply_migration(migration) {
                tracing::error!(version = %migration.version, completed, "migration batch halted");
                return Err(MigrationError::BatchHalted {
                    version: migration.version.clone(),
                    completed,
                    source: Box::new(e),
                });
            }
        }

        tracing::info!(count = pending.len(), "applied migrations");
        Ok(pending.len())
    }

    /// Rolls back applied migrations newer than `target` (all of them when
    /// `target` is `None`), newest first. Returns how many were rolled back.
    ///
    /// The run halts at the first failing rollback; earlier rollbacks in
    /// the same run stay rolled back.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::BatchHalted` wrapping the first failure.
    pub fn migrate_down(&self, target: Option<&Version>) -> Result<usize, MigrationError> {
        self.create_migrations_table()?;

        let mut applied: Vec<Version> = self
            .get_applied_migrations()?
            .into_iter()
            .map(|m| m.version)
            .collect();
        if let Some(target) = target {
            applied.retain(|v| v.numeric_cmp(target) == Ordering::Greater);
        }

        if applied.is_empty() {
            tracing::info!("no applied migrations to roll back");
            return Ok(0);
        }

        applied.reverse();
        for (completed, version) in applied.iter().enumerate() {
            if let Err(e) = self.rollback_migration(version) {
                tracing::error!(%version, completed, "rollback batch halted");
                return Err(MigrationError::BatchHalted {
                    version: version.clone(),
                    completed,
                    source: Box::new(e),
                });
            }
        }

        tracing::info!(count = applied.len(), "rolled back migrations");
        Ok(applied.len())
    }

    /// Reports applied, available, and pending migrations along with drift.
    ///
    /// Read-only: a database without a tracking table reports nothing
    /// applied.
    ///
    /// # Errors
    ///
    /// Propagates discovery, file read, and tracking-table errors.
    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let applied = self.get_applied_migrations()?;
        let available = self.get_available_migrations()?;

        let pending: Vec<MigrationFile> = available
            .iter()
            .filter(|m| !is_applied(&applied, &m.version))
            .cloned()
            .collect();

        let (drifted, missing_files) = self.compare_checksums(&applied, &available)?;

        Ok(MigrationStatus {
            applied_count: applied.len(),
            available_count: available.len(),
            pending_count: pending.len(),
            applied,
            pending,
            drifted,
            missing_files,
        })
    }

    /// Applied migrations whose file on disk no longer matches the checksum
    /// recorded when they were applied.
    ///
    /// # Errors
    ///
    /// Propagates discovery, file read, and tracking-table errors.
    pub fn verify(&self) -> Result<Vec<ChecksumDrift>, MigrationError> {
        let applied = self.get_applied_migrations()?;
        let available = self.get_available_migrations()?;
        let (drifted, _) = self.compare_checksums(&applied, &available)?;
        for drift in &drifted {
            tracing::warn!(
                version = %drift.version,
                path = %drift.path.display(),
                "applied migration changed on disk"
            );
        }
        Ok(drifted)
    }

    fn compare_checksums(
        &self,
        applied: &[AppliedMigration],
        available: &[MigrationFile],
    ) -> Result<(Vec<ChecksumDrift>, Vec<Version>), MigrationError> {
        let mut drifted = Vec::new();
        let mut missing = Vec::new();
        for record in applied {
            let Some(file) = available
                .iter()
                .find(|m| m.version.same_number(&record.version))
            else {
                missing.push(record.version.clone());
                continue;
            };
            let current = checksum(&read_script(&file.path)?);
            if record.checksum.as_deref() != Some(current.as_str()) {
                drifted.push(ChecksumDrift {
                    version: record.version.clone(),
                    recorded: record.checksum.clone(),
                    current,
                    path: file.path.clone(),
                });
            }
        }

        Ok((drifted, missing))
    }

    /// Writes a stub for a new migration and returns it.
    ///
    /// The version is one past the highest on disk, keeping its zero
    /// padding, or [`BASELINE_VERSION`] for an empty directory. The name is
    /// reduced to lowercase letters, digits, and underscores.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidName` if nothing usable remains of
    /// `name`, `MigrationError::FileExists` if the target file exists, and
    /// `MigrationError::Io` on write failure.
    pub fn create_migration(&self, name: &str) -> Result<MigrationFile, MigrationError> {
        let slug = slugify(name).ok_or_else(|| MigrationError::InvalidName(name.to_string()))?;

        std::fs::create_dir_all(&self.dir).map_err(|source| MigrationError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let version = match self.get_available_migrations()?.last() {
            Some(last) => last.version.successor()?,
            None => Version::parse(BASELINE_VERSION)?,
        };

        let path = self.dir.join(format!("{version}_{slug}.sql"));
        let stub = format!(
            "-- Migration: {slug}\n\
             -- Version: {version}\n\
             -- Created: {}\n\
             \n\
             -- Add your SQL statements here\n",
            chrono::Utc::now().to_rfc3339()
        );
        write_new(&path, &stub)?;

        tracing::info!(%version, path = %path.display(), "created migration file");
        Ok(MigrationFile {
            version,
            name: slug.replace('_', " "),
            path,
        })
    }

    /// Writes an `R{version}.sql` stub for an existing migration version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::FileExists` if the script already exists and
    /// `MigrationError::Io` on write failure.
    pub fn create_rollback(&self, version: &Version) -> Result<PathBuf, MigrationError> {
        let path = self.dir.join(rollback_file_name(version));
        let stub = format!(
            "-- Rollback for migration {version}\n\
             -- Created: {}\n\
             \n\
             -- Add SQL statements that undo migration {version} here\n",
            chrono::Utc::now().to_rfc3339()
        );
        write_new(&path, &stub)?;

        tracing::info!(%version, path = %path.display(), "created rollback file");
        Ok(path)
    }
}

fn is_applied(applied: &[AppliedMigration], version: &Version) -> bool {
    applied.iter().any(|m| m.version.same_number(version))
}

fn run_statements(
    tx: &TransactionScope,
    version: &Version,
    statements: &[String],
) -> Result<(), MigrationError> {
    for (idx, statement) in statements.iter().enumerate() {
        tracing::debug!(%version, index = idx + 1, "executing migration statement");
        tx.execute_batch(statement)
            .map_err(|source| MigrationError::Statement {
                version: version.clone(),
                index: idx + 1,
                source,
            })?;
    }
    Ok(())
}

/// Lowercase snake case of `name`, or `None` if no letters or digits remain.
fn slugify(name: &str) -> Option<String> {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    (!slug.is_empty()).then_some(slug)
}

fn write_new(path: &Path, content: &str) -> Result<(), MigrationError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                MigrationError::FileExists(path.to_path_buf())
            } else {
                MigrationError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
    file.write_all(content.as_bytes())
        .map_err(|source| MigrationError::Io {
            path: path.to_path_buf(),
            source,
        })
}
