//! Schema-aware SQL checks: table/column existence against a live `DbSchema`.

use crate::error::CheckResult;
use crate::schema_introspect::DbSchema;
use crate::sql_analysis::{SqlAnalysis, analyze_sql};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlCheckLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlCheckIssueKind {
    MissingTable,
    MissingColumn,
    AmbiguousColumn,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCheckIssue {
    pub level: SqlCheckLevel,
    pub kind: SqlCheckIssueKind,
    pub message: String,
    /// Byte offset in the SQL string (as reported by the Postgres parser), if available.
    pub location: Option<i32>,
}

/// System columns that exist on every table but aren't exposed by our
/// introspection query.
const SYSTEM_COLUMNS: [&str; 6] = ["ctid", "xmin", "xmax", "cmin", "cmax", "tableoid"];

pub fn check_sql(schema: &DbSchema, sql: &str) -> Vec<SqlCheckIssue> {
    let analysis = analyze_sql(sql);
    check_sql_analysis(schema, &analysis)
}

/// A resolved qualifier (alias or bare table name) to the base table it names.
#[derive(Debug, Clone)]
pub struct QualifierMap {
    /// qualifier -> (schema, table)
    by_qualifier: HashMap<String, (String, String)>,
}

impl QualifierMap {
    pub fn resolve(&self, qualifier: &str) -> Option<&(String, String)> {
        self.by_qualifier.get(qualifier)
    }
}

/// Resolve every `RangeVar` in `analysis` (excluding CTE references) against
/// `schema`, building a map from visible qualifier (alias, or bare table name
/// when unaliased) to the `(schema, table)` it resolves to.
///
/// Unknown tables are reported as `MissingTable` issues but do not stop
/// resolution of the remaining references.
pub fn resolve_qualifiers(schema: &DbSchema, analysis: &SqlAnalysis) -> (QualifierMap, Vec<SqlCheckIssue>) {
    let mut issues = Vec::new();
    let mut by_qualifier = HashMap::new();

    for rv in &analysis.range_vars {
        if analysis.cte_names.contains(&rv.table) {
            continue;
        }

        let qualifier = rv.alias.as_deref().unwrap_or(&rv.table).to_string();

        match resolve_table(schema, rv.schema.as_deref(), &rv.table) {
            Ok(Some(resolved)) => {
                by_qualifier.insert(qualifier, resolved);
            }
            Ok(None) => {
                let name = match &rv.schema {
                    Some(s) => format!("{s}.{}", rv.table),
                    None => rv.table.clone(),
                };
                issues.push(SqlCheckIssue {
                    level: SqlCheckLevel::Error,
                    kind: SqlCheckIssueKind::MissingTable,
                    message: format!("table not found: {name}"),
                    location: rv.location,
                });
            }
            Err(e) => issues.push(SqlCheckIssue {
                level: SqlCheckLevel::Error,
                kind: SqlCheckIssueKind::MissingTable,
                message: e.to_string(),
                location: rv.location,
            }),
        }
    }

    (QualifierMap { by_qualifier }, issues)
}

pub fn check_sql_analysis(schema: &DbSchema, analysis: &SqlAnalysis) -> Vec<SqlCheckIssue> {
    let (qualifiers, mut issues) = resolve_qualifiers(schema, analysis);
    let system_columns: HashSet<&'static str> = SYSTEM_COLUMNS.into_iter().collect();
    let visible_tables: Vec<&(String, String)> = qualifiers.by_qualifier.values().collect();

    for c in &analysis.column_refs {
        if c.has_star || c.parts.is_empty() {
            continue;
        }

        if c.parts.len() == 1 {
            let col = c.parts[0].as_str();
            if system_columns.contains(col) {
                continue;
            }

            let matches = visible_tables
                .iter()
                .filter(|(s, t)| table_has_column(schema, s, t, col))
                .count();

            match matches {
                0 => issues.push(SqlCheckIssue {
                    level: SqlCheckLevel::Error,
                    kind: SqlCheckIssueKind::MissingColumn,
                    message: format!("column not found: {col}"),
                    location: c.location,
                }),
                1 => {}
                _ => issues.push(SqlCheckIssue {
                    level: SqlCheckLevel::Error,
                    kind: SqlCheckIssueKind::AmbiguousColumn,
                    message: format!("ambiguous column reference: {col}"),
                    location: c.location,
                }),
            }
            continue;
        }

        if c.parts.len() == 2 {
            let qualifier = c.parts[0].as_str();
            let col = c.parts[1].as_str();

            if system_columns.contains(col) {
                continue;
            }

            if let Some((s, t)) = qualifiers.resolve(qualifier) {
                if !table_has_column(schema, s, t, col) {
                    issues.push(SqlCheckIssue {
                        level: SqlCheckLevel::Error,
                        kind: SqlCheckIssueKind::MissingColumn,
                        message: format!("column not found: {qualifier}.{col} (resolved to {s}.{t})"),
                        location: c.location,
                    });
                }
            } else if analysis.cte_names.contains(qualifier) {
                // CTE column sets aren't tracked; treat as valid.
            } else {
                issues.push(SqlCheckIssue {
                    level: SqlCheckLevel::Error,
                    kind: SqlCheckIssueKind::MissingTable,
                    message: format!("unknown table/alias qualifier: {qualifier}"),
                    location: c.location,
                });
            }
            continue;
        }

        if c.parts.len() == 3 || c.parts.len() == 4 {
            let (schema_part, table_part, col_part) = if c.parts.len() == 3 {
                (&c.parts[0], &c.parts[1], &c.parts[2])
            } else {
                (&c.parts[1], &c.parts[2], &c.parts[3])
            };

            if system_columns.contains(col_part.as_str()) {
                continue;
            }

            if schema.find_table(schema_part, table_part).is_none() {
                issues.push(SqlCheckIssue {
                    level: SqlCheckLevel::Error,
                    kind: SqlCheckIssueKind::MissingTable,
                    message: format!("table not found: {schema_part}.{table_part}"),
                    location: c.location,
                });
                continue;
            }

            if !table_has_column(schema, schema_part, table_part, col_part) {
                issues.push(SqlCheckIssue {
                    level: SqlCheckLevel::Error,
                    kind: SqlCheckIssueKind::MissingColumn,
                    message: format!("column not found: {schema_part}.{table_part}.{col_part}"),
                    location: c.location,
                });
            }
            continue;
        }

        issues.push(SqlCheckIssue {
            level: SqlCheckLevel::Warning,
            kind: SqlCheckIssueKind::Unsupported,
            message: format!(
                "unsupported column reference form ({} parts): {}",
                c.parts.len(),
                c.parts.join(".")
            ),
            location: c.location,
        });
    }

    issues
}

/// Resolve a (possibly unqualified) table reference against `schema`'s
/// configured user schemas. Returns `Err` if the bare name is ambiguous across
/// more than one configured schema.
pub fn resolve_table(
    schema: &DbSchema,
    explicit_schema: Option<&str>,
    table: &str,
) -> CheckResult<Option<(String, String)>> {
    if let Some(s) = explicit_schema {
        return Ok(schema
            .find_table(s, table)
            .map(|_| (s.to_string(), table.to_string())));
    }

    let mut found: Option<(String, String)> = None;
    for s in &schema.schemas {
        if schema.find_table(s, table).is_some() {
            if found.is_some() {
                return Err(crate::error::CheckError::validation(format!(
                    "table name is ambiguous in configured schemas: {table}"
                )));
            }
            found = Some((s.to_string(), table.to_string()));
        }
    }

    Ok(found)
}

/// Whether `schema.table` (already resolved) exposes `column`.
pub fn table_has_column(schema: &DbSchema, table_schema: &str, table: &str, column: &str) -> bool {
    let Some(t) = schema.find_table(table_schema, table) else {
        return false;
    };
    t.columns.iter().any(|c| c.name == column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_introspect::{ColumnInfo, RelationKind, TableInfo};

    fn schema() -> DbSchema {
        DbSchema {
            schemas: vec!["public".into()],
            tables: vec![TableInfo {
                schema: "public".into(),
                name: "users".into(),
                kind: RelationKind::Table,
                columns: vec![
                    ColumnInfo {
                        name: "id".into(),
                        data_type: "integer".into(),
                        is_nullable: false,
                        is_primary_key: true,
                        ordinal: 1,
                    },
                    ColumnInfo {
                        name: "password".into(),
                        data_type: "text".into(),
                        is_nullable: false,
                        is_primary_key: false,
                        ordinal: 2,
                    },
                ],
            }],
        }
    }

    #[test]
    fn flags_missing_column() {
        let issues = check_sql(&schema(), "SELECT nope FROM users");
        assert!(
            issues
                .iter()
                .any(|i| i.kind == SqlCheckIssueKind::MissingColumn)
        );
    }

    #[test]
    fn flags_missing_table() {
        let issues = check_sql(&schema(), "SELECT id FROM ghosts");
        assert!(
            issues
                .iter()
                .any(|i| i.kind == SqlCheckIssueKind::MissingTable)
        );
    }

    #[test]
    fn resolves_alias_qualified_column() {
        let issues = check_sql(&schema(), "SELECT u.id FROM users u");
        assert!(issues.is_empty());
    }
}
