//! nlsql-check
//!
//! Dialect-aware SQL parsing and schema introspection for PostgreSQL, with no
//! orchestration, LLM, or rate-limiting concerns of its own. Parses with
//! `pg_query`, walks the AST for table/column/function references, deparses a
//! rewritten statement with an injected or clamped `LIMIT`, and introspects
//! `pg_catalog` for live schema metadata.

pub mod client;
pub mod error;
pub mod schema_introspect;
pub mod sql_analysis;
pub mod sql_check;
pub mod sql_lint;
pub mod sql_rewrite;

pub use client::{CheckClient, RowExt};
pub use error::{CheckError, CheckResult};
pub use schema_introspect::{ColumnInfo, DbSchema, RelationKind, TableInfo, load_schema_from_db};
pub use sql_analysis::{ColumnRefFull, FunctionCallRef, RangeVarRef, SqlAnalysis, analyze_sql};
pub use sql_check::{
    QualifierMap, SqlCheckIssue, SqlCheckIssueKind, SqlCheckLevel, check_sql, check_sql_analysis,
    resolve_qualifiers, resolve_table, table_has_column,
};
pub use sql_lint::{StatementKind, detect_statement_kind, get_table_names, is_valid_sql};
pub use sql_rewrite::enforce_select_limit;
