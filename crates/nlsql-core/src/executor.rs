//! SQL Executor (C2): runs a validated, already-LIMIT-enforced statement
//! against one database inside a read-only transaction.

use std::time::{Duration, Instant};

use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::Row;
use tokio_postgres::types::Type as PgType;

use crate::error::ExecutionError;
use crate::policy::SecurityPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// True when more rows existed than `policy.max_rows` and the result was
    /// truncated at the cap (the validator should already have injected a
    /// matching LIMIT, so this only fires if the statement's own LIMIT was
    /// somehow looser — e.g. an EXPLAIN or a generator bug).
    pub row_count_capped: bool,
    pub execution_time_ms: u64,
}

/// Runs statements against one specific database. Never reused across
/// policies (per-DB isolation over a shared executor).
pub struct SqlExecutor {
    pool: Pool,
}

/// Session parameters applied, in order, at the start of every transaction.
/// `search_path` is set before `role` so that an unqualified object lookup
/// during role validation itself still resolves against the safe path.
fn session_set_statements(policy: &SecurityPolicy) -> Result<Vec<String>, ExecutionError> {
    let mut stmts = Vec::new();

    if let Some(search_path) = &policy.safe_search_path {
        if !search_path.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',' || c.is_whitespace()) {
            return Err(ExecutionError::InvalidSessionParameter {
                name: "search_path",
                value: search_path.clone(),
            });
        }
        stmts.push(format!("SET search_path = {search_path}"));
    }

    if let Some(role) = &policy.readonly_role {
        if !role.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ExecutionError::InvalidSessionParameter {
                name: "role",
                value: role.clone(),
            });
        }
        stmts.push(format!("SET ROLE {role}"));
    }

    Ok(stmts)
}

impl SqlExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Execute `sql` (already validated and LIMIT-enforced by C1) inside a
    /// read-only transaction, enforcing `policy.max_execution_seconds` (or
    /// `timeout_override`, when given) via a statement timeout and
    /// `policy.max_rows` as a belt-and-braces cap on the fetched result.
    pub async fn execute(
        &self,
        sql: &str,
        policy: &SecurityPolicy,
        timeout_override: Option<Duration>,
    ) -> Result<QueryResult, ExecutionError> {
        let started = Instant::now();

        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| ExecutionError::ConnectionLost(e.to_string()))?;

        let timeout = timeout_override.unwrap_or_else(|| Duration::from_secs(policy.max_execution_seconds));
        let timeout_ms = timeout.as_millis();
        let session_statements = session_set_statements(policy)?;

        let tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(ExecutionError::from_db_error)?;

        // `SET` takes a literal, not a bind parameter — PostgreSQL's grammar
        // for `SET` never accepts `$1` in the value position. `timeout_ms` is
        // always a plain integer derived from a `Duration`, so interpolating
        // it is safe.
        tx.execute(&format!("SET statement_timeout = {timeout_ms}"), &[])
            .await
            .map_err(ExecutionError::from_db_error)?;

        for stmt in &session_statements {
            tx.execute(stmt.as_str(), &[])
                .await
                .map_err(ExecutionError::from_db_error)?;
        }

        let query_future = tx.query(sql, &[]);
        let rows = match tokio::time::timeout(timeout, query_future).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => return Err(ExecutionError::from_db_error(e)),
            Err(_) => return Err(ExecutionError::Timeout),
        };

        // Read-only, so commit/rollback are equivalent; commit releases locks promptly.
        tx.commit().await.map_err(ExecutionError::from_db_error)?;

        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let max_rows = policy.max_rows.max(0) as usize;
        let row_count_capped = rows.len() > max_rows;
        if row_count_capped {
            return Err(ExecutionError::RowCapExceeded {
                max_rows: policy.max_rows,
            });
        }

        let result_rows = rows.iter().map(row_to_json_values).collect();

        Ok(QueryResult {
            columns,
            rows: result_rows,
            row_count_capped: false,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Converts one row into a vector of JSON values, one per column, dispatched
/// by the column's Postgres type.
fn row_to_json_values(row: &Row) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| extract_value(row, i, col.type_()))
        .collect()
}

fn extract_value(row: &Row, index: usize, ty: &PgType) -> Value {
    let as_text = || row.try_get::<_, Option<String>>(index).ok().flatten().map(Value::String);

    let extracted: Option<Value> = match *ty {
        PgType::BOOL => row.try_get::<_, Option<bool>>(index).ok().flatten().map(Value::Bool),
        PgType::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into())),
        PgType::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into())),
        PgType::INT8 => row
            .try_get::<_, Option<i64>>(index)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into())),
        PgType::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number),
        PgType::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        PgType::JSON | PgType::JSONB => row.try_get::<_, Option<Value>>(index).ok().flatten(),
        // Any other type, including timestamps/dates/uuids: fall back to a
        // text representation rather than failing the whole result for one
        // exotic column.
        _ => as_text(),
    };

    extracted.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn policy() -> SecurityPolicy {
        SecurityPolicy {
            blocked_tables: HashSet::new(),
            blocked_columns: HashSet::new(),
            blocked_functions: HashSet::new(),
            allow_explain: false,
            max_rows: 1000,
            max_execution_seconds: 5,
            readonly_role: Some("app_readonly".to_string()),
            safe_search_path: Some("public".to_string()),
            max_subquery_depth: 4,
            confidence_threshold: 70,
            reject_star_on_stale_metadata: crate::policy::StarOnStaleMetadataPolicy::Reject,
        }
    }

    #[test]
    fn session_statements_set_search_path_then_role() {
        let stmts = session_set_statements(&policy()).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("SET search_path"));
        assert!(stmts[1].starts_with("SET ROLE"));
    }

    #[test]
    fn rejects_unsafe_role_characters() {
        let mut p = policy();
        p.readonly_role = Some("app; DROP TABLE users".to_string());
        let err = session_set_statements(&p).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSessionParameter { name: "role", .. }));
    }

    #[test]
    fn rejects_unsafe_search_path_characters() {
        let mut p = policy();
        p.safe_search_path = Some("public; DROP TABLE users".to_string());
        let err = session_set_statements(&p).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSessionParameter { name: "search_path", .. }));
    }
}
