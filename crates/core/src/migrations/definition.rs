//! Migration definitions and migration files.
//!
//! A migration file is named `<version>_<description>.sql`. Its body is the up
//! script, optionally introduced by a `-- UP` line, followed by a `-- DOWN`
//! line and the down script:
//!
//! ```sql
//! -- UP
//! CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//! -- DOWN
//! DROP TABLE tags;
//! ```

use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Error;

/// One versioned schema change. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub up: String,
    /// Empty when the migration cannot be rolled back.
    pub down: String,
    /// Hex SHA-256 of the up script followed by the down script.
    pub checksum: String,
}

/// Checksum recorded in the ledger for a migration's scripts.
pub fn compute_checksum(up: &str, down: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up.as_bytes());
    hasher.update(down.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_marker(line: &str, name: &str) -> bool {
    line.trim()
        .strip_prefix("--")
        .is_some_and(|rest| rest.trim().eq_ignore_ascii_case(name))
}

impl Migration {
    pub fn new(version: i64, description: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        let up = up.into().trim().to_string();
        let down = down.into().trim().to_string();
        let checksum = compute_checksum(&up, &down);
        Self { version, description: description.into(), up, down, checksum }
    }

    pub fn has_rollback(&self) -> bool {
        !self.down.is_empty()
    }

    /// Build a migration from a file name and its contents.
    pub fn parse(file_name: &str, contents: &str) -> Result<Self, Error> {
        let stem = file_name
            .strip_suffix(".sql")
            .ok_or_else(|| Error::MigrationParse(format!("{file_name}: expected a .sql file")))?;
        let (version, description) = stem
            .split_once('_')
            .ok_or_else(|| Error::MigrationParse(format!("{file_name}: expected <version>_<description>.sql")))?;
        let version: i64 = version
            .parse()
            .map_err(|e| Error::MigrationParse(format!("{file_name}: bad version {version:?}: {e}")))?;
        if version <= 0 {
            return Err(Error::MigrationParse(format!("{file_name}: version must be positive")));
        }

        let mut up = Vec::new();
        let mut down = Vec::new();
        let mut in_down = false;
        for line in contents.lines() {
            if is_marker(line, "DOWN") {
                if in_down {
                    return Err(Error::MigrationParse(format!("{file_name}: more than one -- DOWN marker")));
                }
                in_down = true;
            } else if is_marker(line, "UP") {
                if in_down || !up.iter().all(|l: &&str| l.trim().is_empty()) {
                    return Err(Error::MigrationParse(format!("{file_name}: -- UP must open the file")));
                }
            } else if in_down {
                down.push(line);
            } else {
                up.push(line);
            }
        }

        let up = up.join("\n");
        if up.trim().is_empty() {
            return Err(Error::MigrationParse(format!("{file_name}: empty up script")));
        }

        Ok(Self::new(version, description.replace('_', " "), up, down.join("\n")))
    }
}

/// Read every `*.sql` migration in `dir`, sorted by version.
///
/// Duplicate versions are kept so validation can report them.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>, Error> {
    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "sql") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let contents = std::fs::read_to_string(&path)?;
        migrations.push(Migration::parse(name, &contents)?);
    }
    migrations.sort_by_key(|m| m.version);
    tracing::debug!(dir = %dir.display(), count = migrations.len(), "loaded migration definitions");
    Ok(migrations)
}
