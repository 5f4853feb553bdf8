//! AST-level fact extraction over a single parsed SQL statement.
//!
//! This module only reports what a statement *says* — tables, columns, function
//! calls, nesting — it does not know about policy or schema. `nlsql-core`'s
//! validator combines these facts with a `SecurityPolicy` and a `SchemaSnapshot`.

use crate::sql_lint::{ParseResult, StatementKind, statement_kind_of};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeVarRef {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
    pub alias: Option<String>,
    pub location: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRefFull {
    /// Name parts, excluding `*`.
    pub parts: Vec<String>,
    pub has_star: bool,
    pub location: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallRef {
    /// Name parts, e.g. `["pg_sleep"]` or `["pg_catalog", "pg_sleep"]`.
    pub parts: Vec<String>,
    pub location: Option<i32>,
}

impl FunctionCallRef {
    /// The bare (unqualified) function name, lowercased.
    pub fn name(&self) -> String {
        self.parts
            .last()
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// `schema.name`, lowercased, if the call was schema-qualified.
    pub fn qualified_name(&self) -> Option<String> {
        if self.parts.len() >= 2 {
            let n = self.parts.len();
            Some(format!(
                "{}.{}",
                self.parts[n - 2].to_ascii_lowercase(),
                self.parts[n - 1].to_ascii_lowercase()
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlAnalysis {
    pub parse_result: ParseResult,
    /// Number of top-level statements found. 0 when parsing failed.
    pub statement_count: usize,
    pub statement_kind: Option<StatementKind>,
    /// For EXPLAIN statements, the kind of the wrapped statement.
    pub explain_inner_kind: Option<StatementKind>,
    /// True when EXPLAIN ... ANALYZE was requested.
    pub explain_analyze: bool,

    pub cte_names: HashSet<String>,
    pub range_vars: Vec<RangeVarRef>,
    pub table_names: Vec<String>,
    pub column_refs: Vec<ColumnRefFull>,
    pub function_calls: Vec<FunctionCallRef>,

    pub select_has_limit: Option<bool>,
    pub select_has_star: Option<bool>,
    /// Existing literal `LIMIT n` on the top-level SELECT, if any and if it is a
    /// plain integer constant (not a parameter or expression).
    pub select_limit_literal: Option<i64>,

    /// Nesting depth of the deepest `SELECT` below the top-level statement.
    /// 0 means no nested subqueries were found.
    pub subquery_depth: u32,
}

fn location_opt(loc: i32) -> Option<i32> {
    if loc < 0 { None } else { Some(loc) }
}

pub fn analyze_sql(sql: &str) -> SqlAnalysis {
    match pg_query::parse(sql) {
        Ok(parsed) => analyze_parsed(parsed),
        Err(e) => {
            let error_str = e.to_string();
            let location = extract_error_location(&error_str);
            SqlAnalysis {
                parse_result: ParseResult {
                    valid: false,
                    error: Some(error_str),
                    error_location: location,
                },
                statement_count: 0,
                statement_kind: None,
                explain_inner_kind: None,
                explain_analyze: false,
                cte_names: HashSet::new(),
                range_vars: Vec::new(),
                table_names: Vec::new(),
                column_refs: Vec::new(),
                function_calls: Vec::new(),
                select_has_limit: None,
                select_has_star: None,
                select_limit_literal: None,
                subquery_depth: 0,
            }
        }
    }
}

fn analyze_parsed(parsed: pg_query::ParseResult) -> SqlAnalysis {
    let statement_count = parsed.protobuf.stmts.len();
    let cte_names: HashSet<String> = parsed.cte_names.iter().cloned().collect();

    let mut statement_kind: Option<StatementKind> = None;
    let mut explain_inner_kind: Option<StatementKind> = None;
    let mut explain_analyze = false;
    let mut select_has_limit: Option<bool> = None;
    let mut select_limit_literal: Option<i64> = None;

    let top_stmt = parsed
        .protobuf
        .stmts
        .first()
        .and_then(|s| s.stmt.as_ref())
        .and_then(|s| s.node.as_ref());

    if let Some(stmt) = top_stmt {
        statement_kind = Some(statement_kind_of(stmt));

        match stmt {
            pg_query::NodeEnum::SelectStmt(select) => {
                select_has_limit =
                    Some(select.limit_count.is_some() || select.limit_offset.is_some());
                select_limit_literal = literal_limit(select);
            }
            pg_query::NodeEnum::ExplainStmt(explain) => {
                explain_analyze = explain.options.iter().any(|o| {
                    matches!(o.node.as_ref(), Some(pg_query::NodeEnum::DefElem(d)) if d.defname.eq_ignore_ascii_case("analyze"))
                });
                if let Some(inner) = explain.query.as_ref().and_then(|q| q.node.as_ref()) {
                    explain_inner_kind = Some(statement_kind_of(inner));
                    if let pg_query::NodeEnum::SelectStmt(select) = inner {
                        select_has_limit =
                            Some(select.limit_count.is_some() || select.limit_offset.is_some());
                        select_limit_literal = literal_limit(select);
                    }
                }
            }
            _ => {}
        }
    }

    let mut range_vars = Vec::new();
    let mut table_names: Vec<String> = Vec::new();
    let mut column_refs = Vec::new();
    let mut function_calls = Vec::new();
    let mut has_star = false;
    let mut select_depths: Vec<i32> = Vec::new();

    for (node, depth, _context, _has_filter_columns) in parsed.protobuf.nodes() {
        match node {
            pg_query::NodeRef::SelectStmt(_) => {
                select_depths.push(depth);
            }
            pg_query::NodeRef::RangeVar(v) => {
                let r = RangeVarRef {
                    catalog: if v.catalogname.is_empty() {
                        None
                    } else {
                        Some(v.catalogname.to_string())
                    },
                    schema: if v.schemaname.is_empty() {
                        None
                    } else {
                        Some(v.schemaname.to_string())
                    },
                    table: v.relname.to_string(),
                    alias: v.alias.as_ref().map(|a| a.aliasname.to_string()),
                    location: location_opt(v.location),
                };

                range_vars.push(r.clone());

                if cte_names.contains(&r.table) {
                    continue;
                }

                let name = match &r.schema {
                    Some(s) => format!("{s}.{}", r.table),
                    None => r.table.clone(),
                };
                if !table_names.contains(&name) {
                    table_names.push(name);
                }
            }
            pg_query::NodeRef::ColumnRef(c) => {
                let mut parts: Vec<String> = Vec::new();
                let mut star = false;

                for f in &c.fields {
                    match f.node.as_ref() {
                        Some(pg_query::NodeEnum::String(s)) => parts.push(s.sval.clone()),
                        Some(pg_query::NodeEnum::AStar(_)) => star = true,
                        _ => {}
                    }
                }

                if star {
                    has_star = true;
                }

                let col_ref = ColumnRefFull {
                    parts,
                    has_star: star,
                    location: location_opt(c.location),
                };

                if !column_refs.contains(&col_ref) {
                    column_refs.push(col_ref);
                }
            }
            pg_query::NodeRef::FuncCall(f) => {
                let parts: Vec<String> = f
                    .funcname
                    .iter()
                    .filter_map(|n| match n.node.as_ref() {
                        Some(pg_query::NodeEnum::String(s)) => Some(s.sval.clone()),
                        _ => None,
                    })
                    .collect();

                if !parts.is_empty() {
                    let call = FunctionCallRef {
                        parts,
                        location: location_opt(f.location),
                    };
                    if !function_calls.contains(&call) {
                        function_calls.push(call);
                    }
                }
            }
            _ => {}
        }
    }

    let subquery_depth = match (select_depths.iter().min(), select_depths.iter().max()) {
        (Some(min), Some(max)) => (max - min).max(0) as u32,
        _ => 0,
    };

    let select_has_star = if matches!(statement_kind, Some(StatementKind::Select))
        || matches!(explain_inner_kind, Some(StatementKind::Select))
    {
        Some(has_star)
    } else {
        None
    };

    SqlAnalysis {
        parse_result: ParseResult {
            valid: true,
            error: None,
            error_location: None,
        },
        statement_count,
        statement_kind,
        explain_inner_kind,
        explain_analyze,
        cte_names,
        range_vars,
        table_names,
        column_refs,
        function_calls,
        select_has_limit,
        select_has_star,
        select_limit_literal,
        subquery_depth,
    }
}

impl PartialEq for FunctionCallRef {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}
impl Eq for FunctionCallRef {}

fn literal_limit(select: &pg_query::protobuf::SelectStmt) -> Option<i64> {
    let node = select.limit_count.as_deref()?;
    match node.node.as_ref()? {
        pg_query::NodeEnum::AConst(c) => match c.val.as_ref()? {
            pg_query::protobuf::a_const::Val::Ival(i) => Some(i.ival as i64),
            _ => None,
        },
        _ => None,
    }
}

/// Extract error location from pg_query error message.
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
    fn captures_function_calls() {
        let a = analyze_sql("SELECT pg_sleep(5), id FROM users");
        assert!(a.function_calls.iter().any(|f| f.name() == "pg_sleep"));
    }

    #[test]
    fn captures_schema_qualified_function() {
        let a = analyze_sql("SELECT pg_catalog.pg_sleep(5) FROM users");
        assert_eq!(
            a.function_calls
                .iter()
                .find_map(|f| f.qualified_name())
                .as_deref(),
            Some("pg_catalog.pg_sleep")
        );
    }

    #[test]
    fn nested_subquery_depth() {
        let flat = analyze_sql("SELECT id FROM users");
        assert_eq!(flat.subquery_depth, 0);

        let nested =
            analyze_sql("SELECT id FROM users WHERE id IN (SELECT user_id FROM orders)");
        assert!(nested.subquery_depth >= 1);
    }

    #[test]
    fn explain_reports_inner_kind_and_analyze_flag() {
        let a = analyze_sql("EXPLAIN ANALYZE SELECT * FROM users");
        assert_eq!(a.statement_kind, Some(StatementKind::Explain));
        assert_eq!(a.explain_inner_kind, Some(StatementKind::Select));
        assert!(a.explain_analyze);
    }

    #[test]
    fn literal_limit_extracted() {
        let a = analyze_sql("SELECT id FROM users LIMIT 10");
        assert_eq!(a.select_limit_literal, Some(10));
    }

    #[test]
    fn counts_multiple_statements() {
        let a = analyze_sql("SELECT 1; SELECT 2");
        assert_eq!(a.statement_count, 2);
    }

    #[test]
    fn cte_table_excluded_from_table_names() {
        let a = analyze_sql("WITH recent AS (SELECT 1 AS id) SELECT * FROM recent");
        assert!(!a.table_names.contains(&"recent".to_string()));
    }
}
