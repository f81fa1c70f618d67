//! Statement execution and row conversion.
//!
//! Results leave the worker thread as [`Rows`], a JSON-friendly owned shape
//! that can be cached, serialized into tool output, or inspected by tests.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_rusqlite::rusqlite::{self, types::ValueRef};

/// Bound parameter value.
pub type SqlValue = rusqlite::types::Value;

/// Result of running one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    /// Rows changed by a statement that returned no columns.
    pub rows_affected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_rowid: Option<i64>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at `row`, `column` by column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&JsonValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

fn value_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(hex::encode(b)),
    }
}

/// Convert a JSON parameter into a bindable value.
///
/// Arrays and objects are bound as their JSON text.
pub fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Prepare and run `sql`, returning rows for statements with result columns
/// and the affected-row count otherwise.
///
/// Column names and row width are read from the statement after it has been
/// stepped. A statement compiled against a schema another connection has
/// since changed is re-prepared by its first step, and only then describes
/// the current columns.
pub(crate) fn run_statement(conn: &rusqlite::Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Rows> {
    let mut stmt = conn.prepare(sql)?;

    if stmt.column_count() == 0 {
        let affected = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        return Ok(Rows {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: affected,
            last_insert_rowid: Some(conn.last_insert_rowid()),
        });
    }

    let mut out = Vec::new();
    {
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let width = row.as_ref().column_count();
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(value_to_json(row.get_ref(idx)?));
            }
            out.push(values);
        }
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    Ok(Rows { columns, rows: out, rows_affected: 0, last_insert_rowid: None })
}

/// Whether `sql` only reads.
///
/// Used to pick the reader role and to decide whether a result may be cached.
/// Anything that is not clearly a query goes to a writer.
pub fn is_read_statement(sql: &str) -> bool {
    let head = strip_leading_comments(sql);
    let keyword: String = head.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    match keyword.to_ascii_uppercase().as_str() {
        "SELECT" | "VALUES" | "EXPLAIN" => true,
        "WITH" => {
            let upper = head.to_ascii_uppercase();
            !["INSERT ", "UPDATE ", "DELETE ", "REPLACE "].iter().any(|kw| upper.contains(kw))
        }
        _ => false,
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else {
            return rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_statement_detection() {
        assert!(is_read_statement("SELECT * FROM entries"));
        assert!(is_read_statement("  -- list\n select 1"));
        assert!(is_read_statement("/* hint */ WITH t AS (SELECT 1) SELECT * FROM t"));
        assert!(!is_read_statement("WITH t AS (SELECT 1) DELETE FROM entries WHERE id IN t"));
        assert!(!is_read_statement("INSERT INTO entries VALUES (1)"));
        assert!(!is_read_statement("PRAGMA journal_mode=DELETE"));
        assert!(!is_read_statement(""));
    }

    #[test]
    fn test_run_statement_rows_and_changes() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB)")
            .unwrap();

        let inserted = run_statement(
            &conn,
            "INSERT INTO t (name, score, data) VALUES (?1, ?2, ?3)",
            &[SqlValue::Text("a".into()), SqlValue::Real(1.5), SqlValue::Blob(vec![0xde, 0xad])],
        )
        .unwrap();
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.last_insert_rowid, Some(1));

        let rows = run_statement(&conn, "SELECT id, name, score, data FROM t", &[]).unwrap();
        assert_eq!(rows.columns, vec!["id", "name", "score", "data"]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0, "name"), Some(&JsonValue::from("a")));
        assert_eq!(rows.get(0, "score"), Some(&JsonValue::from(1.5)));
        assert_eq!(rows.get(0, "data"), Some(&JsonValue::from("dead")));
    }

    #[test]
    fn test_columns_follow_schema_changed_by_another_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");
        let reader = rusqlite::Connection::open(&path).unwrap();
        let writer = rusqlite::Connection::open(&path).unwrap();
        writer
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT); INSERT INTO t (name) VALUES ('x');")
            .unwrap();

        let before = run_statement(&reader, "SELECT * FROM t", &[]).unwrap();
        assert_eq!(before.columns, vec!["id", "name"]);

        writer.execute_batch("ALTER TABLE t ADD COLUMN c INTEGER DEFAULT 7").unwrap();
        let after = run_statement(&reader, "SELECT * FROM t", &[]).unwrap();
        assert_eq!(after.columns, vec!["id", "name", "c"]);
        assert_eq!(after.rows, vec![vec![JsonValue::from(1), JsonValue::from("x"), JsonValue::from(7)]]);

        writer.execute_batch("ALTER TABLE t ADD COLUMN d TEXT").unwrap();
        let empty = run_statement(&reader, "SELECT * FROM t WHERE id = 99", &[]).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.columns, vec!["id", "name", "c", "d"]);
    }

    #[test]
    fn test_json_to_sql() {
        assert_eq!(json_to_sql(&serde_json::json!(3)), SqlValue::Integer(3));
        assert_eq!(json_to_sql(&serde_json::json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&serde_json::json!("x")), SqlValue::Text("x".into()));
        assert_eq!(json_to_sql(&serde_json::json!([1, 2])), SqlValue::Text("[1,2]".into()));
    }
}
