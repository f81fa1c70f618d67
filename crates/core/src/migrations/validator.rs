//! Pre- and post-conditions around applying a migration, and schema
//! snapshots for before/after comparison.
//!
//! Pre-validation is a dry run inside a transaction that is always rolled
//! back: schema statements are executed so later statements see their effect,
//! everything else is only prepared. A statement that fails to prepare because
//! a table does not exist is reported as a missing dependency; any other
//! failure as a rejected statement.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, TransactionBehavior};

use super::analysis::split_statements;
use super::definition::Migration;
use crate::Error;
use crate::pool::PooledConnection;

/// Dry-run `migrations` in order, as if applied one after another.
///
/// Nothing is left behind. The first failure is returned as
/// [`Error::MigrationValidation`] naming its version.
pub(crate) async fn pre_validate(conn: &PooledConnection, migrations: &[Migration]) -> Result<(), Error> {
    let migrations = migrations.to_vec();
    conn.call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for m in &migrations {
            if let Err(reason) = dry_run(&tx, m) {
                tracing::warn!(version = m.version, %reason, "migration failed pre-validation");
                return Err(Error::MigrationValidation { version: m.version, reason });
            }
        }
        // Dropping the transaction rolls the dry run back.
        drop(tx);
        Ok(())
    })
    .await
}

fn dry_run(conn: &rusqlite::Connection, migration: &Migration) -> Result<(), String> {
    let statements = split_statements(&migration.up);
    if statements.is_empty() {
        return Err("up script has no statements".into());
    }

    for stmt in &statements {
        if stmt.is_transaction_control() {
            return Err(format!("transaction control is not allowed in a migration: {}", stmt.normalized));
        }
        let result = if stmt.changes_schema() {
            conn.execute_batch(&stmt.text)
        } else {
            conn.prepare(&stmt.text).map(|_| ())
        };
        if let Err(e) = result {
            return Err(classify(&e));
        }
    }
    Ok(())
}

fn classify(e: &rusqlite::Error) -> String {
    let message = e.to_string();
    match message.split_once("no such table: ") {
        Some((_, table)) => format!("depends on missing table {}", table.trim()),
        None => format!("statement rejected: {message}"),
    }
}

/// Tables the up script leaves behind.
fn expected_tables(script: &str) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    for stmt in split_statements(script) {
        if let Some(name) = stmt.created_table() {
            tables.insert(name);
        } else if let Some(name) = stmt.dropped_table() {
            tables.remove(&name);
        }
    }
    tables
}

/// Check the store after `migration` was applied: foreign keys hold, the
/// integrity check passes, and every table the script creates exists.
pub(crate) async fn post_validate(conn: &PooledConnection, migration: &Migration) -> Result<(), Error> {
    let version = migration.version;
    let expected = expected_tables(&migration.up);

    let problems = conn
        .call(move |conn| {
            let mut problems = Vec::new();

            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let violations = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(2)?)))?
                .take(5)
                .collect::<Result<Vec<_>, _>>()?;
            for (table, parent) in violations {
                problems.push(format!("foreign key violation in {table} referencing {parent}"));
            }

            let integrity: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
            if integrity != "ok" {
                problems.push(format!("integrity check failed: {integrity}"));
            }

            for table in &expected {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND lower(name) = ?1)",
                    params![table],
                    |row| row.get(0),
                )?;
                if !exists {
                    problems.push(format!("expected table {table} is missing"));
                }
            }
            Ok(problems)
        })
        .await?;

    if problems.is_empty() {
        Ok(())
    } else {
        let reason = problems.join("; ");
        tracing::warn!(version, %reason, "migration failed post-validation");
        Err(Error::MigrationValidation { version, reason })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// Tables, columns, indexes and foreign keys at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSchema>,
    /// Index name to table name.
    pub indexes: BTreeMap<String, String>,
}

/// What changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub added_columns: BTreeMap<String, Vec<String>>,
    pub removed_columns: BTreeMap<String, Vec<String>>,
    pub added_indexes: Vec<String>,
    pub removed_indexes: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
    }
}

fn missing_from<'a>(left: impl Iterator<Item = &'a String>, right: &BTreeSet<&String>) -> Vec<String> {
    left.filter(|k| !right.contains(k)).cloned().collect()
}

impl SchemaSnapshot {
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_ascii_lowercase())
    }

    /// Changes from `self` to `after`.
    pub fn diff(&self, after: &SchemaSnapshot) -> SchemaDiff {
        let before_tables: BTreeSet<&String> = self.tables.keys().collect();
        let after_tables: BTreeSet<&String> = after.tables.keys().collect();
        let before_indexes: BTreeSet<&String> = self.indexes.keys().collect();
        let after_indexes: BTreeSet<&String> = after.indexes.keys().collect();

        let mut diff = SchemaDiff {
            added_tables: missing_from(after.tables.keys(), &before_tables),
            removed_tables: missing_from(self.tables.keys(), &after_tables),
            added_indexes: missing_from(after.indexes.keys(), &before_indexes),
            removed_indexes: missing_from(self.indexes.keys(), &after_indexes),
            ..Default::default()
        };

        for (name, old) in &self.tables {
            let Some(new) = after.tables.get(name) else { continue };
            let added: Vec<String> = new.columns.iter().filter(|c| !old.columns.contains(c)).cloned().collect();
            let removed: Vec<String> = old.columns.iter().filter(|c| !new.columns.contains(c)).cloned().collect();
            if !added.is_empty() {
                diff.added_columns.insert(name.clone(), added);
            }
            if !removed.is_empty() {
                diff.removed_columns.insert(name.clone(), removed);
            }
        }
        diff
    }
}

fn capture(conn: &rusqlite::Connection) -> rusqlite::Result<SchemaSnapshot> {
    let mut snapshot = SchemaSnapshot::default();

    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    for name in names {
        let mut columns_stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = columns_stmt
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut fk_stmt = conn.prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)")?;
        let foreign_keys = fk_stmt
            .query_map(params![name], |row| {
                let to: Option<String> = row.get(2)?;
                let table: String = row.get(1)?;
                Ok(ForeignKey {
                    column: row.get(0)?,
                    references: match to {
                        Some(col) => format!("{table}({col})"),
                        None => table,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        snapshot.tables.insert(name.to_ascii_lowercase(), TableSchema { columns, foreign_keys });
    }

    let mut stmt = conn.prepare(
        "SELECT name, tbl_name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let indexes = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    snapshot.indexes = indexes.into_iter().map(|(i, t)| (i.to_ascii_lowercase(), t.to_ascii_lowercase())).collect();

    Ok(snapshot)
}

/// Capture the current schema.
pub async fn snapshot(conn: &PooledConnection) -> Result<SchemaSnapshot, Error> {
    conn.call(|conn| Ok(capture(conn)?)).await
}
