//! Per-database identity and the immutable safety configuration that gates
//! every SQL statement run against it.

use serde::Deserialize;
use std::collections::HashSet;

/// Stable textual identifier for a configured database; the orchestrator
/// keys its executor map by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct DatabaseId(pub String);

impl DatabaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Functions the validator always rejects, regardless of per-database policy.
/// Matched case-insensitively, unqualified and schema-qualified, alongside
/// `SecurityPolicy::blocked_functions`.
pub const BUILTIN_BLOCKED_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "pg_sleep_for",
    "pg_sleep_until",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
    "dblink",
    "dblink_connect",
];

/// Immutable per-database safety configuration. Constructed once at startup;
/// the orchestrator never merges policies across databases.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub blocked_tables: HashSet<String>,
    #[serde(default)]
    pub blocked_columns: HashSet<String>,
    #[serde(default)]
    pub blocked_functions: HashSet<String>,

    #[serde(default)]
    pub allow_explain: bool,

    pub max_rows: i64,
    pub max_execution_seconds: u64,

    #[serde(default)]
    pub readonly_role: Option<String>,
    #[serde(default)]
    pub safe_search_path: Option<String>,

    /// Soft cap on subquery nesting depth; sane default below.
    #[serde(default = "default_max_subquery_depth")]
    pub max_subquery_depth: u32,

    /// Confidence threshold (0-100) the Result Validator requires to accept
    /// an NL-generated result without retrying (default 70).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,

    /// Behavior when `blocked_columns` names a column of a table referenced
    /// via `SELECT *` but the schema snapshot is stale or unavailable.
    /// Defaults to the conservative choice.
    #[serde(default)]
    pub reject_star_on_stale_metadata: StarOnStaleMetadataPolicy,
}

/// Behavior of a `SELECT *` over a partially blocked table
/// when schema metadata is stale or unavailable. Rejection is mandatory
/// when the snapshot is current; this knob governs the stale/absent case,
/// which is a policy choice rather than a hardcoded answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarOnStaleMetadataPolicy {
    /// Reject, matching the conservative current-metadata behavior.
    #[default]
    Reject,
    /// Permit; only an explicit, qualified `SELECT *` over a blocked table
    /// that IS reflected in a (possibly stale) snapshot is rejected.
    Permit,
}

fn default_max_subquery_depth() -> u32 {
    4
}

fn default_confidence_threshold() -> u8 {
    70
}

impl SecurityPolicy {
    pub fn is_blocked_function(&self, name: &str, qualified: Option<&str>) -> bool {
        let lname = name.to_ascii_lowercase();
        if BUILTIN_BLOCKED_FUNCTIONS.contains(&lname.as_str()) {
            return true;
        }
        if self
            .blocked_functions
            .iter()
            .any(|b| b.eq_ignore_ascii_case(&lname))
        {
            return true;
        }
        if let Some(q) = qualified {
            let lq = q.to_ascii_lowercase();
            return self
                .blocked_functions
                .iter()
                .any(|b| b.eq_ignore_ascii_case(&lq));
        }
        false
    }

    pub fn is_blocked_table(&self, bare: &str, qualified: Option<&str>) -> bool {
        let lbare = bare.to_ascii_lowercase();
        if self.blocked_tables.iter().any(|t| t.eq_ignore_ascii_case(&lbare)) {
            return true;
        }
        if let Some(q) = qualified {
            let lq = q.to_ascii_lowercase();
            return self.blocked_tables.iter().any(|t| t.eq_ignore_ascii_case(&lq));
        }
        false
    }
}

/// Resilience knobs shared by the circuit breaker and retry engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_seconds: u64,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_factor: f64,
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub retry_jitter: bool,

    pub rate_limit_query_capacity: usize,
    pub rate_limit_llm_capacity: usize,
    pub rate_limit_acquire_timeout_ms: u64,

    #[serde(default = "default_max_llm_retries")]
    pub max_llm_retries: u32,

    pub schema_cache_ttl_seconds: u64,
}

fn default_jitter() -> bool {
    true
}

fn default_max_llm_retries() -> u32 {
    3
}

/// Configuration for the observability stack (C9).
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_sensitive_fields")]
    pub sensitive_fields: HashSet<String>,
    #[serde(default = "default_redaction_token")]
    pub redaction_token: String,
}

fn default_sensitive_fields() -> HashSet<String> {
    [
        "password",
        "passwd",
        "pwd",
        "secret",
        "api_key",
        "token",
        "access_token",
        "private_key",
        "auth",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_redaction_token() -> String {
    "***REDACTED***".to_string()
}

/// Per-database connection configuration, as loaded by an external
/// collaborator (file/env); the core never reads either directly.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub id: DatabaseId,
    pub connection_url: String,
    pub pool_min: usize,
    pub pool_max: usize,
    pub policy: SecurityPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SecurityPolicy {
        SecurityPolicy {
            blocked_tables: ["passwords".into()].into_iter().collect(),
            blocked_columns: HashSet::new(),
            blocked_functions: HashSet::new(),
            allow_explain: false,
            max_rows: 1000,
            max_execution_seconds: 5,
            readonly_role: None,
            safe_search_path: None,
            max_subquery_depth: 4,
            confidence_threshold: 70,
            reject_star_on_stale_metadata: StarOnStaleMetadataPolicy::Reject,
        }
    }

    #[test]
    fn blocked_table_matches_case_insensitively() {
        assert!(policy().is_blocked_table("Passwords", None));
    }

    #[test]
    fn builtin_functions_always_blocked() {
        assert!(policy().is_blocked_function("pg_sleep", None));
    }
}
