//! Migration files on disk: naming, ordering, checksums, statement splitting.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::MigrationError;

/// Extension every migration script carries.
pub const SQL_EXTENSION: &str = "sql";

/// A migration version as written in the file name (`02`, `0015`, ...).
///
/// Versions order numerically, so `9` sorts before `10`. Versions with the
/// same numeric value fall back to comparing the raw text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Parses a version string, which must be non-empty ASCII digits.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidVersion` otherwise.
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MigrationError::InvalidVersion(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Wraps a version read back from the tracking table without
    /// validating it.
    pub(crate) fn recorded(raw: String) -> Self {
        Self(raw)
    }

    /// The version exactly as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The version without leading zeros (`"0"` for all-zero versions).
    fn significant(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() && !self.0.is_empty() {
            "0"
        } else {
            trimmed
        }
    }

    /// Compares numeric values only, so `02` and `002` are equal.
    pub fn numeric_cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.significant(), other.significant());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }

    /// Whether both versions denote the same number.
    pub fn same_number(&self, other: &Self) -> bool {
        self.numeric_cmp(other) == Ordering::Equal
    }

    /// The version incremented by one, keeping at least the current width.
    pub(crate) fn successor(&self) -> Result<Self, MigrationError> {
        let current: u64 = self
            .0
            .parse()
            .map_err(|_| MigrationError::InvalidVersion(self.0.clone()))?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| MigrationError::InvalidVersion(self.0.clone()))?;
        let width = self.0.len().max(2);
        Ok(Self(format!("{next:0width$}")))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric_cmp(other).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A forward migration script found on disk: `{version}_{name}.sql`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFile {
    /// Version prefix of the file name.
    pub version: Version,
    /// Human-readable name (file stem after the version, `_` shown as
    /// spaces).
    pub name: String,
    /// Full path to the script.
    pub path: PathBuf,
}

impl MigrationFile {
    /// Parses a file name of the form `{digits}_{name}.sql`.
    ///
    /// Returns `None` for anything else, including rollback scripts.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(SQL_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (version, name) = stem.split_once('_')?;
        if name.is_empty() {
            return None;
        }
        let version = Version::parse(version).ok()?;

        Some(Self {
            version,
            name: name.replace('_', " "),
            path: path.to_path_buf(),
        })
    }
}

/// File name of the reverse script for `version`.
pub fn rollback_file_name(version: &Version) -> String {
    format!("R{version}.{SQL_EXTENSION}")
}

/// Scans `dir` for forward migrations, sorted by ascending version.
///
/// Files that do not match the naming scheme are ignored. A missing
/// directory yields an empty list.
///
/// # Errors
///
/// Returns `MigrationError::Io` if the directory cannot be read and
/// `MigrationError::DuplicateVersion` if two files share a version.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "migrations directory does not exist");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(MigrationError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MigrationError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match MigrationFile::from_path(&path) {
            Some(file) => found.push(file),
            None => tracing::trace!(path = %path.display(), "ignoring non-migration file"),
        }
    }

    found.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.path.cmp(&b.path)));

    for pair in found.windows(2) {
        if pair[0].version.significant() == pair[1].version.significant() {
            return Err(MigrationError::DuplicateVersion {
                version: pair[1].version.clone(),
                first: pair[0].path.clone(),
                second: pair[1].path.clone(),
            });
        }
    }

    Ok(found)
}

/// Reads a script from disk.
///
/// # Errors
///
/// Returns `MigrationError::Io` if the file cannot be read as UTF-8 text.
pub fn read_script(path: &Path) -> Result<String, MigrationError> {
    std::fs::read_to_string(path).map_err(|source| MigrationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// SHA-256 of the script content, lowercase hex.
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Splits a script into statements on `;`.
///
/// Semicolons inside quoted strings, quoted identifiers, and comments do not
/// split. Segments holding nothing but whitespace and comments are dropped.
/// Statements are returned trimmed, in file order.
pub fn split_statements(sql: &str) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Quoted(char),
        LineComment,
        BlockComment,
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut state = State::Code;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                ';' => {
                    if has_code {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_code = false;
                    continue;
                }
                '\'' | '"' | '`' => {
                    state = State::Quoted(c);
                    has_code = true;
                }
                '-' if chars.peek() == Some(&'-') => state = State::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    current.push(c);
                    if let Some(star) = chars.next() {
                        current.push(star);
                    }
                    state = State::BlockComment;
                    continue;
                }
                c if !c.is_whitespace() => has_code = true,
                _ => {}
            },
            // A doubled quote is an escaped quote: leaving and re-entering
            // the quoted state handles it without special casing.
            State::Quoted(quote) if c == quote => state = State::Code,
            State::Quoted(_) => {}
            State::LineComment if c == '\n' => state = State::Code,
            State::LineComment => {}
            State::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                current.push(c);
                if let Some(slash) = chars.next() {
                    current.push(slash);
                }
                state = State::Code;
                continue;
            }
            State::BlockComment => {}
        }
        current.push(c);
    }

    if has_code {
        statements.push(current.trim().to_string());
    }

    statements
}
