//! Cheap, parse-level SQL inspection utilities that don't need a schema.

use serde::{Deserialize, Serialize};

/// Result of SQL parsing/validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    /// Whether the SQL is syntactically valid.
    pub valid: bool,
    /// Error message if invalid.
    pub error: Option<String>,
    /// Error location (byte offset) if available.
    pub error_location: Option<usize>,
}

/// Type of SQL statement, as far as the top-level node determines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Explain,
    Insert,
    Update,
    Delete,
    CreateTable,
    AlterTable,
    DropTable,
    CreateIndex,
    DropIndex,
    Truncate,
    Begin,
    Commit,
    Rollback,
    With,
    Other,
}

/// Check if a SQL string is syntactically valid.
///
/// # Example
/// ```
/// use nlsql_check::is_valid_sql;
///
/// assert!(is_valid_sql("SELECT * FROM users").valid);
/// assert!(!is_valid_sql("SELEC * FROM users").valid);
/// ```
pub fn is_valid_sql(sql: &str) -> ParseResult {
    match pg_query::parse(sql) {
        Ok(_) => ParseResult {
            valid: true,
            error: None,
            error_location: None,
        },
        Err(e) => {
            let error_str = e.to_string();
            let location = extract_error_location(&error_str);
            ParseResult {
                valid: false,
                error: Some(error_str),
                error_location: location,
            }
        }
    }
}

/// Detect the type of the first (and, for our purposes, only) statement.
///
/// # Example
/// ```
/// use nlsql_check::{detect_statement_kind, StatementKind};
///
/// assert_eq!(detect_statement_kind("SELECT * FROM users"), Some(StatementKind::Select));
/// assert_eq!(detect_statement_kind("EXPLAIN SELECT 1"), Some(StatementKind::Explain));
/// ```
pub fn detect_statement_kind(sql: &str) -> Option<StatementKind> {
    let parsed = pg_query::parse(sql).ok()?;
    let stmts = parsed.protobuf.stmts;

    if stmts.is_empty() {
        return None;
    }

    let stmt = stmts.first()?.stmt.as_ref()?;
    Some(statement_kind_of(stmt.node.as_ref()?))
}

pub(crate) fn statement_kind_of(node: &pg_query::NodeEnum) -> StatementKind {
    use pg_query::NodeEnum;
    match node {
        NodeEnum::SelectStmt(_) => StatementKind::Select,
        NodeEnum::ExplainStmt(_) => StatementKind::Explain,
        NodeEnum::InsertStmt(_) => StatementKind::Insert,
        NodeEnum::UpdateStmt(_) => StatementKind::Update,
        NodeEnum::DeleteStmt(_) => StatementKind::Delete,
        NodeEnum::CreateStmt(_) => StatementKind::CreateTable,
        NodeEnum::AlterTableStmt(_) => StatementKind::AlterTable,
        NodeEnum::DropStmt(_) => StatementKind::DropTable,
        NodeEnum::IndexStmt(_) => StatementKind::CreateIndex,
        NodeEnum::TruncateStmt(_) => StatementKind::Truncate,
        NodeEnum::TransactionStmt(t) => match t.kind() {
            pg_query::protobuf::TransactionStmtKind::TransStmtBegin => StatementKind::Begin,
            pg_query::protobuf::TransactionStmtKind::TransStmtCommit => StatementKind::Commit,
            pg_query::protobuf::TransactionStmtKind::TransStmtRollback => StatementKind::Rollback,
            _ => StatementKind::Other,
        },
        _ => StatementKind::Other,
    }
}

/// Get all table names referenced in a SQL query (CTE names excluded).
///
/// # Example
/// ```
/// use nlsql_check::get_table_names;
///
/// let tables = get_table_names("SELECT * FROM users u JOIN orders o ON u.id = o.user_id");
/// assert!(tables.contains(&"users".to_string()));
/// assert!(tables.contains(&"orders".to_string()));
/// ```
pub fn get_table_names(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();

    let Ok(parsed) = pg_query::parse(sql) else {
        return tables;
    };

    let cte_names: std::collections::HashSet<String> = parsed.cte_names.into_iter().collect();

    for (node, _depth, _context, _has_filter_columns) in parsed.protobuf.nodes() {
        if let pg_query::NodeRef::RangeVar(v) = node {
            if cte_names.contains(&v.relname) {
                continue;
            }

            let table_name = if v.schemaname.is_empty() {
                v.relname.clone()
            } else {
                format!("{}.{}", v.schemaname, v.relname)
            };

            if !tables.contains(&table_name) {
                tables.push(table_name);
            }
        }
    }

    tables
}

/// Extract error location from a pg_query error message.
fn extract_error_location(error: &str) -> Option<usize> {
    if let Some(pos) = error.rfind("position ") {
        let after_pos = &error[pos + 9..];
        let num_str: String = after_pos
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        return num_str.parse().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_explain() {
        assert_eq!(
            detect_statement_kind("EXPLAIN SELECT * FROM users"),
            Some(StatementKind::Explain)
        );
        assert_eq!(
            detect_statement_kind("EXPLAIN ANALYZE SELECT * FROM users"),
            Some(StatementKind::Explain)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid_sql("SELEC * FROM users").valid);
    }

    #[test]
    fn table_names_skip_ctes() {
        let tables =
            get_table_names("WITH recent AS (SELECT 1) SELECT * FROM recent r JOIN orders o ON true");
        assert_eq!(tables, vec!["orders".to_string()]);
    }
}
