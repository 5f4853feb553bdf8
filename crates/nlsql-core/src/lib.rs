//! # nlsql-core
//!
//! The Query Orchestration Core: turns a natural-language question (or a
//! hand-written SQL statement) into a validated, rate-limited, circuit-broken
//! read-only query against one of several configured PostgreSQL databases.
//!
//! The ten components of the external design map directly onto this crate's
//! modules:
//!
//! | Component | Module |
//! |---|---|
//! | C1 SQL Validator | [`validator`] |
//! | C2 SQL Executor | [`executor`] |
//! | C3 Schema Cache | [`schema`] |
//! | C4 SQL Generator | [`generator`] |
//! | C5 Result Validator | [`result_validator`] |
//! | C6 Rate Limiter | [`rate_limiter`] |
//! | C7 Circuit Breaker | [`circuit_breaker`] |
//! | C8 Retry Engine | [`retry`] |
//! | C9 Observability | [`observability`] |
//! | C10 Orchestrator | [`orchestrator`] |

pub mod circuit_breaker;
pub mod error;
pub mod executor;
pub mod generator;
pub mod observability;
pub mod orchestrator;
pub mod policy;
pub mod pool;
pub mod rate_limiter;
pub mod result_validator;
pub mod retry;
pub mod schema;
pub mod validator;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use error::{
    CircuitOpenError, ExecutionError, GenerationError, OrchestrationError, RateLimitError, ValidationError,
};
pub use executor::{QueryResult, SqlExecutor};
pub use generator::{AnthropicClient, CompletionRequest, CompletionResponse, LlmClient};
pub use observability::{Metrics, RedactionLayer, RequestContext};
pub use orchestrator::{DatabaseRegistration, Orchestrator, QueryRequest, QueryResponse};
pub use policy::{
    DatabaseConfig, DatabaseId, ObservabilityConfig, ResilienceConfig, SecurityPolicy, StarOnStaleMetadataPolicy,
};
pub use pool::{PoolError, create_pool, create_pool_with_manager_config, create_pool_with_tls};
pub use rate_limiter::{RateLimitGuard, RateLimiter, RateLimiterRegistry, RateLimiterStats};
pub use result_validator::ResultScore;
pub use retry::{Outcome, RetryPolicy};
pub use schema::{SchemaCache, SchemaCacheRegistry, SchemaSnapshot};
pub use validator::Validated;
