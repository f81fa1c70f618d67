//! Migration ledger: what is applied, planning, apply and rollback.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::TransactionBehavior;

use super::definition::{Migration, load_dir};
use super::plan::MigrationPlan;
use crate::Error;
use crate::config::MigrationConfig;
use crate::pool::{ConnectionPool, PooledConnection, Role};

const LEDGER_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    rollback_sql TEXT NOT NULL DEFAULT '',
    checksum TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
";

/// A row of the `_migrations` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub applied_at: String,
    pub rollback_sql: String,
    pub checksum: String,
    pub duration_ms: u64,
}

/// A problem found by [`MigrationManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    DuplicateVersion { version: i64 },
    SequenceGap { after: i64, next: i64 },
    ChecksumMismatch { version: i64, recorded: String, defined: String },
    /// Applied in the store but no longer defined.
    UnknownApplied { version: i64 },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateVersion { version } => write!(f, "version {version} is defined more than once"),
            Self::SequenceGap { after, next } => write!(f, "versions jump from {after} to {next}"),
            Self::ChecksumMismatch { version, .. } => write!(f, "version {version} changed after it was applied"),
            Self::UnknownApplied { version } => write!(f, "applied version {version} has no definition"),
        }
    }
}

impl From<ValidationIssue> for Error {
    fn from(issue: ValidationIssue) -> Self {
        match issue {
            ValidationIssue::DuplicateVersion { version } => {
                Error::MigrationValidation { version, reason: "duplicate version".into() }
            }
            ValidationIssue::SequenceGap { after, next } => Error::MigrationSequenceGap { after, next },
            ValidationIssue::ChecksumMismatch { version, recorded, defined } => {
                Error::MigrationChecksumMismatch { version, expected: recorded, actual: defined }
            }
            ValidationIssue::UnknownApplied { version } => Error::UnknownMigration { version },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// The first error, if any.
    pub fn into_result(self) -> Result<Self, Error> {
        match self.errors.first() {
            Some(issue) => Err(issue.clone().into()),
            None => Ok(self),
        }
    }
}

/// Owns the migration definitions and the ledger.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    pool: ConnectionPool,
    definitions: Vec<Migration>,
    max_sequence_gap: i64,
}

impl MigrationManager {
    /// Create the ledger table if needed.
    pub async fn new(pool: ConnectionPool, mut definitions: Vec<Migration>) -> Result<Self, Error> {
        definitions.sort_by_key(|m| m.version);
        let conn = pool.acquire(Role::Writer).await?;
        conn.execute_batch(LEDGER_SCHEMA).await?;
        drop(conn);
        let max_sequence_gap = MigrationConfig::default().max_sequence_gap;
        Ok(Self { pool, definitions, max_sequence_gap })
    }

    /// Versions allowed to be missing between consecutive applied versions
    /// before validation reports an error.
    pub fn with_max_sequence_gap(mut self, max_sequence_gap: i64) -> Self {
        self.max_sequence_gap = max_sequence_gap;
        self
    }

    /// Load definitions from `config.directory`. A missing directory means no
    /// migrations.
    pub async fn from_config(pool: ConnectionPool, config: &MigrationConfig) -> Result<Self, Error> {
        let definitions = if config.directory.is_dir() {
            load_dir(&config.directory)?
        } else {
            tracing::warn!(dir = %config.directory.display(), "migration directory not found, no migrations loaded");
            Vec::new()
        };
        Ok(Self::new(pool, definitions).await?.with_max_sequence_gap(config.max_sequence_gap))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn definitions(&self) -> &[Migration] {
        &self.definitions
    }

    /// Highest defined version, or 0.
    pub fn latest_version(&self) -> i64 {
        self.definitions.last().map_or(0, |m| m.version)
    }

    pub fn definition(&self, version: i64) -> Option<&Migration> {
        self.definitions.iter().find(|m| m.version == version)
    }

    /// Highest applied version, or 0 on a fresh store.
    pub async fn current_version(&self) -> Result<i64, Error> {
        let conn = self.pool.acquire(Role::Reader).await?;
        current_version_on(&conn).await
    }

    /// Ledger rows, ascending by version.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, Error> {
        let conn = self.pool.acquire(Role::Reader).await?;
        applied_on(&conn).await
    }

    /// Plan the migrations between the current version and `target`.
    pub async fn plan(&self, target: i64) -> Result<MigrationPlan, Error> {
        let current = self.current_version().await?;
        self.plan_from(current, target)
    }

    /// Plan up to the latest definition. Empty when already there.
    pub async fn plan_latest(&self) -> Result<MigrationPlan, Error> {
        let current = self.current_version().await?;
        let latest = self.latest_version();
        if latest <= current {
            return Ok(MigrationPlan::new(current, current, Vec::new()));
        }
        self.plan_from(current, latest)
    }

    pub(crate) fn plan_from(&self, current: i64, target: i64) -> Result<MigrationPlan, Error> {
        if target <= current {
            return Err(Error::InvalidTarget { target, current });
        }
        if self.definition(target).is_none() {
            return Err(Error::UnknownMigration { version: target });
        }

        let migrations: Vec<Migration> = self
            .definitions
            .iter()
            .filter(|m| m.version > current && m.version <= target)
            .cloned()
            .collect();
        let plan = MigrationPlan::new(current, target, migrations);
        tracing::debug!(
            from = current,
            to = target,
            count = plan.migrations.len(),
            risk = ?plan.risk_level,
            "migration plan computed"
        );
        Ok(plan)
    }

    /// Apply one migration in its own transaction.
    pub async fn apply(&self, migration: &Migration) -> Result<AppliedMigration, Error> {
        let conn = self.pool.acquire(Role::Writer).await?;
        apply_on(&conn, migration).await
    }

    /// Roll back every applied version above `to_version`, newest first.
    ///
    /// Checks that each of them has a down script before running any. Returns
    /// the versions rolled back.
    pub async fn rollback(&self, to_version: i64) -> Result<Vec<i64>, Error> {
        if to_version < 0 {
            return Err(Error::InvalidInput(format!("rollback target {to_version} is negative")));
        }
        let conn = self.pool.acquire(Role::Writer).await?;
        let applied = applied_on(&conn).await?;
        let targets: Vec<AppliedMigration> = applied.into_iter().rev().filter(|a| a.version > to_version).collect();

        if let Some(missing) = targets.iter().find(|a| a.rollback_sql.trim().is_empty()) {
            return Err(Error::MissingRollbackScript { version: missing.version });
        }

        let mut rolled_back = Vec::with_capacity(targets.len());
        for (i, record) in targets.iter().enumerate() {
            if let Err(e) = revert_on(&conn, record).await {
                let remaining: Vec<i64> = targets[i..].iter().map(|a| a.version).collect();
                tracing::error!(version = record.version, error = %e, ?remaining, "rollback stopped");
                return Err(Error::MigrationRollbackFailure { version: record.version, remaining, reason: e.to_string() });
            }
            rolled_back.push(record.version);
        }

        tracing::info!(to_version, versions = ?rolled_back, "rolled back migrations");
        Ok(rolled_back)
    }

    /// Check definitions against the ledger.
    ///
    /// Duplicate definitions and changed checksums are errors. Gaps between
    /// consecutive applied versions are warnings, or errors when more
    /// versions are missing than the configured tolerance. Applied versions
    /// with no definition are warnings.
    pub async fn validate(&self) -> Result<ValidationReport, Error> {
        let applied = self.applied().await?;
        let mut report = ValidationReport::default();

        let mut seen = HashSet::new();
        for m in &self.definitions {
            if !seen.insert(m.version) {
                report.errors.push(ValidationIssue::DuplicateVersion { version: m.version });
            }
        }

        let versions: Vec<i64> = applied.iter().map(|r| r.version).collect();
        for (issue, missing) in sequence_gaps(&versions) {
            if missing > self.max_sequence_gap {
                report.errors.push(issue);
            } else {
                report.warnings.push(issue);
            }
        }

        for record in &applied {
            match self.definition(record.version) {
                None => report.warnings.push(ValidationIssue::UnknownApplied { version: record.version }),
                Some(m) if m.checksum != record.checksum => report.errors.push(ValidationIssue::ChecksumMismatch {
                    version: record.version,
                    recorded: record.checksum.clone(),
                    defined: m.checksum.clone(),
                }),
                Some(_) => {}
            }
        }

        report.valid = report.errors.is_empty();
        if !report.valid {
            tracing::warn!(errors = report.errors.len(), warnings = report.warnings.len(), "migration validation failed");
        }
        Ok(report)
    }

    /// Reject a plan that would leave a gap wider than the tolerance between
    /// its versions or after the current one.
    pub(crate) fn check_plan_gaps(&self, plan: &MigrationPlan) -> Result<(), Error> {
        let mut versions = Vec::with_capacity(plan.migrations.len() + 1);
        // An empty ledger has no predecessor to measure from.
        if plan.from_version > 0 {
            versions.push(plan.from_version);
        }
        versions.extend(plan.versions());
        match sequence_gaps(&versions).find(|(_, missing)| *missing > self.max_sequence_gap) {
            Some((issue, _)) => Err(issue.into()),
            None => Ok(()),
        }
    }
}

/// Gaps between consecutive entries of ascending `versions`, with the count
/// of versions missing from each.
fn sequence_gaps(versions: &[i64]) -> impl Iterator<Item = (ValidationIssue, i64)> + '_ {
    versions.windows(2).filter_map(|pair| {
        let missing = pair[1] - pair[0] - 1;
        (missing > 0).then_some((ValidationIssue::SequenceGap { after: pair[0], next: pair[1] }, missing))
    })
}

pub(crate) async fn current_version_on(conn: &PooledConnection) -> Result<i64, Error> {
    conn.call(|conn| {
        let version = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))?;
        Ok(version)
    })
    .await
}

pub(crate) async fn applied_on(conn: &PooledConnection) -> Result<Vec<AppliedMigration>, Error> {
    conn.call(|conn| {
        let mut stmt = conn.prepare(
            "SELECT version, description, applied_at, rollback_sql, checksum, duration_ms
             FROM _migrations ORDER BY version ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AppliedMigration {
                version: row.get(0)?,
                description: row.get(1)?,
                applied_at: row.get(2)?,
                rollback_sql: row.get(3)?,
                checksum: row.get(4)?,
                duration_ms: row.get::<_, i64>(5)?.max(0) as u64,
            })
        })?;
        let applied = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(applied)
    })
    .await
}

/// Run the up script and record it, atomically.
pub(crate) async fn apply_on(conn: &PooledConnection, migration: &Migration) -> Result<AppliedMigration, Error> {
    let m = migration.clone();
    let record = conn
        .call(move |conn| {
            let started = std::time::Instant::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![m.version],
                |row| row.get(0),
            )?;
            if exists {
                return Err(Error::MigrationAlreadyApplied { version: m.version });
            }

            tx.execute_batch(&m.up)?;
            let record = AppliedMigration {
                version: m.version,
                description: m.description,
                applied_at: chrono::Utc::now().to_rfc3339(),
                rollback_sql: m.down,
                checksum: m.checksum,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            tx.execute(
                "INSERT INTO _migrations (version, description, applied_at, rollback_sql, checksum, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.version,
                    &record.description,
                    &record.applied_at,
                    &record.rollback_sql,
                    &record.checksum,
                    record.duration_ms as i64,
                ],
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await?;

    tracing::info!(
        version = record.version,
        description = %record.description,
        duration_ms = record.duration_ms,
        "migration applied"
    );
    Ok(record)
}

/// Run a recorded down script and delete the ledger row, atomically.
pub(crate) async fn revert_on(conn: &PooledConnection, record: &AppliedMigration) -> Result<(), Error> {
    if record.rollback_sql.trim().is_empty() {
        return Err(Error::MissingRollbackScript { version: record.version });
    }
    let version = record.version;
    let down = record.rollback_sql.clone();
    conn.call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(&down)?;
        tx.execute("DELETE FROM _migrations WHERE version = ?1", params![version])?;
        tx.commit()?;
        Ok(())
    })
    .await?;
    tracing::info!(version, "migration rolled back");
    Ok(())
}
