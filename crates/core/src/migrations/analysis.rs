//! Static analysis of migration scripts.
//!
//! Scripts are split into statements without a full SQL parser: the scanner
//! only tracks string literals, quoted identifiers, comments and trigger
//! bodies, which is all that is needed to find statement boundaries and the
//! leading keywords risk assessment looks at.

use serde::Serialize;

use super::definition::Migration;
use super::plan::RiskLevel;

/// One statement of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Statement {
    /// Original text, without the terminating `;`.
    pub(crate) text: String,
    /// Uppercased, comments removed, literals blanked, whitespace collapsed.
    pub(crate) normalized: String,
}

impl Statement {
    fn new(text: &str, normalized: &str) -> Option<Self> {
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return None;
        }
        Some(Self { text: text.trim().to_string(), normalized })
    }

    fn starts_with(&self, words: &str) -> bool {
        self.normalized == words || self.normalized.starts_with(&format!("{words} "))
    }

    fn is_trigger(&self) -> bool {
        self.starts_with("CREATE TRIGGER")
            || self.starts_with("CREATE TEMP TRIGGER")
            || self.starts_with("CREATE TEMPORARY TRIGGER")
    }

    /// Whether a trigger's body has been closed by its matching `END`.
    ///
    /// `CASE` expressions also end in `END`, so they count towards the depth.
    fn trigger_closed(&self) -> bool {
        let mut depth = 0i32;
        let mut opened = false;
        let is_word = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '"' | '`' | '[' | ']');
        for word in self.normalized.split(|c: char| !is_word(c)) {
            match word {
                "BEGIN" => {
                    opened = true;
                    depth += 1;
                }
                "CASE" => depth += 1,
                "END" => depth -= 1,
                _ => {}
            }
        }
        opened && depth <= 0
    }

    /// `ALTER TABLE .. DROP [COLUMN] ..`.
    fn drops_column(&self) -> bool {
        self.starts_with("ALTER TABLE") && self.normalized.contains(" DROP ")
    }

    /// `BEGIN`, `COMMIT` and friends, which would break the apply transaction.
    pub(crate) fn is_transaction_control(&self) -> bool {
        ["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"]
            .iter()
            .any(|kw| self.starts_with(kw))
    }

    /// Schema-only DDL that later statements may depend on. Index builds are
    /// left out since they can be expensive and nothing depends on them.
    pub(crate) fn changes_schema(&self) -> bool {
        if self.starts_with("CREATE INDEX") || self.starts_with("CREATE UNIQUE INDEX") {
            return false;
        }
        self.starts_with("CREATE") || self.starts_with("ALTER") || self.starts_with("DROP")
    }

    /// Name of the table a `DROP TABLE` statement drops.
    pub(crate) fn dropped_table(&self) -> Option<String> {
        let rest = self.normalized.strip_prefix("DROP TABLE ")?;
        let rest = rest.strip_prefix("IF EXISTS ").unwrap_or(rest);
        let name = rest.split_whitespace().next()?;
        Some(unquote(name.rsplit('.').next().unwrap_or(name)))
    }

    /// Name of the table a `CREATE TABLE` statement creates.
    pub(crate) fn created_table(&self) -> Option<String> {
        let rest = ["CREATE TABLE ", "CREATE TEMP TABLE ", "CREATE TEMPORARY TABLE ", "CREATE VIRTUAL TABLE "]
            .iter()
            .find_map(|prefix| self.normalized.strip_prefix(prefix))?;
        let rest = rest.strip_prefix("IF NOT EXISTS ").unwrap_or(rest);
        let name = rest.split(|c: char| c == '(' || c.is_whitespace()).next()?;
        Some(unquote(name.rsplit('.').next().unwrap_or(name)))
    }
}

/// Strip identifier quoting and lowercase, for name comparisons.
pub(crate) fn unquote(name: &str) -> String {
    name.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']')).to_ascii_lowercase()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    /// Closing character, and whether the contents are an identifier that
    /// stays visible to keyword analysis.
    Quoted(char, bool),
    LineComment,
    BlockComment,
}

/// Split `script` into statements.
pub(crate) fn split_statements(script: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut text = String::new();
    let mut normalized = String::new();
    let mut state = Scan::Code;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            Scan::Code => match c {
                '\'' | '"' | '`' | '[' => {
                    state = match c {
                        '\'' => Scan::Quoted('\'', false),
                        '[' => Scan::Quoted(']', true),
                        _ => Scan::Quoted(c, true),
                    };
                    text.push(c);
                    normalized.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = Scan::LineComment;
                    text.push_str("--");
                    normalized.push(' ');
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Scan::BlockComment;
                    text.push_str("/*");
                    normalized.push(' ');
                }
                ';' => {
                    let pending = Statement::new(&text, &normalized.to_ascii_uppercase());
                    match pending {
                        // A trigger body holds its own `;`-terminated statements.
                        Some(stmt) if stmt.is_trigger() && !stmt.trigger_closed() => {
                            text.push(c);
                            normalized.push(c);
                        }
                        Some(stmt) => {
                            statements.push(stmt);
                            text.clear();
                            normalized.clear();
                        }
                        None => {
                            text.clear();
                            normalized.clear();
                        }
                    }
                }
                _ => {
                    text.push(c);
                    normalized.push(c);
                }
            },
            Scan::Quoted(close, identifier) => {
                text.push(c);
                if identifier {
                    normalized.push(c);
                }
                if c == close {
                    // Doubled quote is an escaped quote.
                    if chars.peek() == Some(&close) && close != ']' {
                        text.push(close);
                        if identifier {
                            normalized.push(close);
                        }
                        chars.next();
                    } else {
                        if !identifier {
                            normalized.push(close);
                        }
                        state = Scan::Code;
                    }
                }
            }
            Scan::LineComment => {
                text.push(c);
                if c == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                text.push(c);
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    text.push('/');
                    state = Scan::Code;
                }
            }
        }
    }

    if let Some(stmt) = Statement::new(&text, &normalized.to_ascii_uppercase()) {
        statements.push(stmt);
    }
    statements
}

/// Risk findings for one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationAssessment {
    pub version: i64,
    pub risk_level: RiskLevel,
    /// Drops a table or column.
    pub destructive: bool,
    pub estimated_duration_ms: u64,
    pub findings: Vec<String>,
}

fn statement_cost_ms(stmt: &Statement) -> u64 {
    if stmt.starts_with("CREATE INDEX") || stmt.starts_with("CREATE UNIQUE INDEX") {
        200
    } else if stmt.starts_with("ALTER TABLE") {
        100
    } else if stmt.starts_with("UPDATE") || stmt.starts_with("DELETE") || stmt.starts_with("INSERT") {
        500
    } else {
        10
    }
}

fn snippet(stmt: &Statement) -> String {
    const MAX: usize = 60;
    match stmt.normalized.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &stmt.normalized[..idx]),
        None => stmt.normalized.clone(),
    }
}

/// Classify a migration by what its up script does.
///
/// Dropping a table or column is high risk; an `UPDATE` or `DELETE` with no
/// `WHERE` clause is medium. Anything destructive without a down script is
/// critical, since it cannot be undone.
pub fn assess(migration: &Migration) -> MigrationAssessment {
    let mut level = RiskLevel::Low;
    let mut destructive = false;
    let mut findings = Vec::new();
    let mut estimated_duration_ms = 0;

    for stmt in split_statements(&migration.up) {
        estimated_duration_ms += statement_cost_ms(&stmt);

        if stmt.starts_with("DROP TABLE") || stmt.drops_column() {
            destructive = true;
            level = level.max(RiskLevel::High);
            findings.push(format!("destructive: {}", snippet(&stmt)));
        } else if (stmt.starts_with("UPDATE") || stmt.starts_with("DELETE")) && !stmt.normalized.contains(" WHERE ") {
            level = level.max(RiskLevel::Medium);
            findings.push(format!("unguarded write: {}", snippet(&stmt)));
        }
    }

    if destructive && !migration.has_rollback() {
        level = RiskLevel::Critical;
        findings.push("destructive change has no down script".to_string());
    }

    MigrationAssessment { version: migration.version, risk_level: level, destructive, estimated_duration_ms, findings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(script: &str) -> Vec<String> {
        split_statements(script).into_iter().map(|s| s.text).collect()
    }

    #[test]
    fn test_split_respects_literals_and_comments() {
        let script = "INSERT INTO t VALUES ('a;b'); -- trailing; comment\n/* x; y */ SELECT \"c;d\" FROM t;";
        let stmts = texts(script);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "INSERT INTO t VALUES ('a;b')");
        assert!(stmts[1].ends_with("SELECT \"c;d\" FROM t"));
    }

    #[test]
    fn test_split_escaped_quote() {
        let stmts = texts("INSERT INTO t VALUES ('it''s; fine'); SELECT 1");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_split_keeps_trigger_body_together() {
        let script = "CREATE TRIGGER trg AFTER INSERT ON a BEGIN\n  INSERT INTO b VALUES (new.id);\n  UPDATE c SET n = n + 1;\nEND;\nSELECT 1;";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].normalized.starts_with("CREATE TRIGGER"));
        assert!(stmts[0].normalized.ends_with("END"));
    }

    #[test]
    fn test_case_expression_inside_trigger_body() {
        let script = "CREATE TRIGGER trg AFTER INSERT ON a BEGIN\n  \
                      UPDATE b SET kind = CASE WHEN new.n > 0 THEN 'pos' ELSE 'neg' END;\n  \
                      INSERT INTO c VALUES (new.id);\nEND;\nCREATE TABLE d (id INTEGER);";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].normalized.contains("INSERT INTO C"));
        assert!(stmts[0].normalized.ends_with("END"));
        assert_eq!(stmts[1].created_table(), Some("d".to_string()));
    }

    #[test]
    fn test_trigger_with_case_in_when_clause() {
        let script = "CREATE TRIGGER trg AFTER UPDATE ON a WHEN CASE new.n WHEN 1 THEN 1 ELSE 0 END BEGIN\n  \
                      DELETE FROM b WHERE id = new.id;\nEND; SELECT 1;";
        let stmts = texts(script);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "SELECT 1");
    }

    #[test]
    fn test_literal_contents_do_not_trigger_findings() {
        let m = Migration::new(1, "note", "INSERT INTO notes VALUES ('DROP TABLE users')", "");
        assert_eq!(assess(&m).risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_created_table_names() {
        let stmts = split_statements(
            "CREATE TABLE IF NOT EXISTS \"Entries\"(id INTEGER); CREATE TABLE main.tags (id INTEGER); CREATE INDEX i ON t(x)",
        );
        let names: Vec<_> = stmts.iter().map(|s| s.created_table()).collect();
        assert_eq!(names, vec![Some("entries".to_string()), Some("tags".to_string()), None]);
    }

    #[test]
    fn test_transaction_control_detected() {
        let stmts = split_statements("BEGIN; CREATE TABLE t (id INTEGER); COMMIT;");
        let flags: Vec<bool> = stmts.iter().map(Statement::is_transaction_control).collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[test]
    fn test_risk_levels() {
        let low = Migration::new(1, "add", "CREATE TABLE t (id INTEGER);", "DROP TABLE t;");
        assert_eq!(assess(&low).risk_level, RiskLevel::Low);
        assert!(!assess(&low).destructive);

        let medium = Migration::new(2, "reset", "UPDATE entries SET score = 0;", "");
        assert_eq!(assess(&medium).risk_level, RiskLevel::Medium);

        let guarded = Migration::new(3, "fix", "DELETE FROM entries WHERE id = 1;", "");
        assert_eq!(assess(&guarded).risk_level, RiskLevel::Low);

        let high = Migration::new(4, "drop", "DROP TABLE legacy;", "CREATE TABLE legacy (id INTEGER);");
        let assessment = assess(&high);
        assert_eq!(assessment.risk_level, RiskLevel::High);
        assert!(assessment.destructive);

        let column =
            Migration::new(5, "drop col", "ALTER TABLE entries DROP COLUMN old;", "ALTER TABLE entries ADD COLUMN old TEXT;");
        assert_eq!(assess(&column).risk_level, RiskLevel::High);

        let bare =
            Migration::new(7, "drop col", "ALTER TABLE entries DROP old;", "ALTER TABLE entries ADD COLUMN old TEXT;");
        assert!(assess(&bare).destructive);
        assert_eq!(assess(&bare).risk_level, RiskLevel::High);

        let rename = Migration::new(8, "rename", "ALTER TABLE entries RENAME COLUMN dropped TO kept;", "");
        assert!(!assess(&rename).destructive);

        let critical = Migration::new(6, "drop", "DROP TABLE legacy;", "");
        assert_eq!(assess(&critical).risk_level, RiskLevel::Critical);
    }
}
