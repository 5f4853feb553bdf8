//! Error taxonomy for the Query Orchestration Core.
//!
//! Every variant below corresponds to one `code` string on the wire (see the
//! RPC surface) and knows whether it is retryable, so the orchestrator's
//! propagation policy has one place to check both.

use thiserror::Error;

/// Sub-codes for a rejected SQL statement (see [`ValidationError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSubCode {
    MultipleStatements,
    StatementKindRejected,
    BlockedTable,
    BlockedColumn,
    BlockedFunction,
    SubqueryTooDeep,
    InvalidLimit,
}

impl ValidationSubCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleStatements => "MultipleStatements",
            Self::StatementKindRejected => "StatementKindRejected",
            Self::BlockedTable => "BlockedTable",
            Self::BlockedColumn => "BlockedColumn",
            Self::BlockedFunction => "BlockedFunction",
            Self::SubqueryTooDeep => "SubqueryTooDeep",
            Self::InvalidLimit => "InvalidLimit",
        }
    }
}

/// Errors raised by the SQL Validator (C1).
#[derive(Debug, Error)]
#[error("{sub_code:?}: {message}")]
pub struct ValidationError {
    pub sub_code: ValidationSubCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(sub_code: ValidationSubCode, message: impl Into<String>) -> Self {
        Self {
            sub_code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        "ValidationError"
    }

    /// Never retryable to the client; the orchestrator's NL loop treats it as
    /// corrective feedback instead, which is a separate mechanism from retry.
    pub fn retryable(&self) -> bool {
        false
    }
}

/// Sub-codes for [`GenerationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationSubCode {
    LlmTransient,
    MalformedOutput,
}

/// Errors raised by the SQL Generator (C4).
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("LLM call failed: {0}")]
    LlmTransient(String),
    #[error("LLM produced unusable output: {raw}")]
    MalformedOutput { raw: String },
}

impl GenerationError {
    pub fn sub_code(&self) -> GenerationSubCode {
        match self {
            Self::LlmTransient(_) => GenerationSubCode::LlmTransient,
            Self::MalformedOutput { .. } => GenerationSubCode::MalformedOutput,
        }
    }

    pub fn code(&self) -> &'static str {
        "GenerationError"
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::LlmTransient(_))
    }
}

/// Errors raised by the SQL Executor (C2).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("query exceeded its execution budget")]
    Timeout,
    #[error("result exceeded the configured row cap of {max_rows}")]
    RowCapExceeded { max_rows: i64 },
    #[error("SQL execution failed: {0}")]
    SqlExecutionError(String),
    #[error("driver reported a transient error: {0}")]
    DriverTransient(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("invalid session parameter {name}: {value:?}")]
    InvalidSessionParameter { name: &'static str, value: String },
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::RowCapExceeded { .. } => "RowCapExceeded",
            Self::SqlExecutionError(_) => "SQLExecutionError",
            Self::DriverTransient(_) => "DriverTransient",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::InvalidSessionParameter { .. } => "InvalidSessionParameter",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::DriverTransient(_) | Self::ConnectionLost(_))
    }

    /// Classify a driver-level error as one of the retryable executor kinds,
    /// falling back to a non-retryable `SqlExecutionError`. Mirrors the
    /// Postgres SQLSTATE class checks the core ORM uses to distinguish
    /// constraint violations from connection failures.
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return Self::ConnectionLost(err.to_string());
        }
        if let Some(db_err) = err.as_db_error() {
            // Class 08 = connection exception, 53/57/58 = resource/operator/system errors.
            let class = &db_err.code().code()[0..2];
            if matches!(class, "08" | "53" | "57" | "58") {
                return Self::DriverTransient(err.to_string());
            }
        } else {
            // No SQLSTATE at all (I/O error, etc.) — treat as transient.
            return Self::DriverTransient(err.to_string());
        }
        Self::SqlExecutionError(err.to_string())
    }
}

/// Errors raised by the Rate Limiter (C6).
#[derive(Debug, Error)]
#[error("rate limit '{name}' timed out after {waited:?}")]
pub struct RateLimitError {
    pub name: String,
    pub waited: std::time::Duration,
}

impl RateLimitError {
    pub fn code(&self) -> &'static str {
        "RateLimitTimeout"
    }
    pub fn retryable(&self) -> bool {
        false
    }
}

/// Errors raised by the Circuit Breaker (C7).
#[derive(Debug, Error)]
#[error("circuit '{key}' is open")]
pub struct CircuitOpenError {
    pub key: String,
}

impl CircuitOpenError {
    pub fn code(&self) -> &'static str {
        "CircuitOpen"
    }
    pub fn retryable(&self) -> bool {
        false
    }
}

/// Top-level error returned by the Orchestrator (C10); every other error kind
/// converts into this one at the orchestration boundary.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("database '{0}' is not configured")]
    DatabaseNotFound(String),

    #[error("no database specified and more than one is configured")]
    AmbiguousDatabase,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("exhausted {attempts} generation attempts without an accepted result")]
    GenerationExhausted { attempts: u32 },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Circuit(#[from] CircuitOpenError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseNotFound(_) => "DatabaseNotFound",
            Self::AmbiguousDatabase => "AmbiguousDatabase",
            Self::Validation(_) => "ValidationError",
            Self::Generation(_) => "GenerationError",
            Self::GenerationExhausted { .. } => "GenerationExhausted",
            Self::Execution(e) => e.code(),
            Self::RateLimit(_) => "RateLimitTimeout",
            Self::Circuit(_) => "CircuitOpen",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Whether an orchestration-level caller could usefully retry this whole
    /// request. Distinct from the inner `Retry Engine`'s notion of
    /// retryability, which only ever sees [`ExecutionError`]/[`GenerationError`].
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Execution(e) if e.retryable())
            || matches!(self, Self::Generation(e) if e.retryable())
    }
}
