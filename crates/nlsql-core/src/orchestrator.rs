//! Orchestrator (C10): the request-level state machine composing C1-C9.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, instrument, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::{ExecutionError, OrchestrationError, ValidationError};
use crate::executor::{QueryResult, SqlExecutor};
use crate::generator::{LlmClient, build_prompt, extract_sql};
use crate::observability::{Metrics, RequestContext};
use crate::policy::{DatabaseId, SecurityPolicy};
use crate::rate_limiter::RateLimiterRegistry;
use crate::result_validator;
use crate::retry::{self, Outcome, RetryPolicy};
use crate::schema::SchemaCache;
use crate::validator;

/// Inbound request: exactly one of `prompt`/`sql` is expected to be set by
/// the RPC layer; both present is treated as the raw-SQL path taking
/// precedence, matching the transport's documented dispatch order.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub prompt: Option<String>,
    pub sql: Option<String>,
    pub database: Option<String>,
    /// Caps the NL generate/validate/execute/score loop at fewer attempts
    /// than `max_llm_retries`; ignored on the raw-SQL path. `None` keeps the
    /// orchestrator's configured default.
    pub max_retries_override: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub sql_executed: String,
    pub result: QueryResult,
    pub tokens_used: u32,
    pub warning: Option<String>,
}

struct DatabaseEntry {
    executor: SqlExecutor,
    policy: SecurityPolicy,
    schema_cache: SchemaCache,
}

/// Owns one `(pool, policy, executor, schema cache)` tuple per configured
/// database (per-DB isolation over a shared executor), plus the shared
/// rate limiters, circuit breakers, LLM client, and metrics.
pub struct Orchestrator {
    databases: HashMap<DatabaseId, DatabaseEntry>,
    llm_client: Arc<dyn LlmClient>,
    rate_limiters: RateLimiterRegistry,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    max_llm_retries: u32,
    metrics: Metrics,
}

pub struct DatabaseRegistration {
    pub id: DatabaseId,
    pub executor: SqlExecutor,
    pub policy: SecurityPolicy,
    pub schema_cache: SchemaCache,
}

impl Orchestrator {
    pub fn new(
        databases: Vec<DatabaseRegistration>,
        llm_client: Arc<dyn LlmClient>,
        rate_limiters: RateLimiterRegistry,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
        retry_policy: RetryPolicy,
        max_llm_retries: u32,
        metrics: Metrics,
    ) -> Self {
        let databases = databases
            .into_iter()
            .map(|d| {
                (
                    d.id,
                    DatabaseEntry {
                        executor: d.executor,
                        policy: d.policy,
                        schema_cache: d.schema_cache,
                    },
                )
            })
            .collect();
        Self {
            databases,
            llm_client,
            rate_limiters,
            circuit_breakers,
            retry_policy,
            max_llm_retries,
            metrics,
        }
    }

    #[instrument(skip(self, request), fields(request_id = %ctx.request_id))]
    pub async fn execute_query(
        &self,
        request: QueryRequest,
        ctx: RequestContext,
    ) -> Result<QueryResponse, OrchestrationError> {
        let started = Instant::now();
        let outcome = self.execute_query_inner(request, &ctx).await;

        let (status, db_label) = match &outcome {
            Ok(_) => ("ok", ctx.database.clone().unwrap_or_default()),
            Err(_) => ("error", ctx.database.clone().unwrap_or_default()),
        };
        self.metrics
            .query_requests_total
            .with_label_values(&[status, &db_label])
            .inc();
        self.metrics
            .query_duration_seconds
            .with_label_values(&[&db_label])
            .observe(started.elapsed().as_secs_f64());

        if let Err(e) = &outcome {
            // Every escape across this boundary is logged exactly once,
            // logged once here, not re-logged by deeper layers.
            error!(request_id = %ctx.request_id, code = e.code(), "request failed");
        }

        outcome
    }

    async fn execute_query_inner(
        &self,
        request: QueryRequest,
        ctx: &RequestContext,
    ) -> Result<QueryResponse, OrchestrationError> {
        // 1. ResolveDatabase
        let db_id = self.resolve_database(request.database.as_deref())?;
        let entry = self.databases.get(&db_id).expect("resolve_database only returns known ids");

        // 2. Branch on input: raw SQL skips the generate loop entirely.
        if let Some(sql) = request.sql {
            return self.execute_raw(&db_id, entry, sql).await;
        }

        let prompt = request
            .prompt
            .ok_or_else(|| OrchestrationError::Internal("request has neither prompt nor sql".to_string()))?;

        let max_attempts = request.max_retries_override.unwrap_or(self.max_llm_retries);
        self.execute_nl(&db_id, entry, &prompt, max_attempts).await
    }

    fn resolve_database(&self, requested: Option<&str>) -> Result<DatabaseId, OrchestrationError> {
        match requested {
            Some(name) => {
                let id = DatabaseId::from(name);
                if self.databases.contains_key(&id) {
                    Ok(id)
                } else {
                    Err(OrchestrationError::DatabaseNotFound(name.to_string()))
                }
            }
            None => {
                if self.databases.len() == 1 {
                    Ok(self.databases.keys().next().cloned().expect("len == 1"))
                } else {
                    Err(OrchestrationError::AmbiguousDatabase)
                }
            }
        }
    }

    async fn execute_raw(
        &self,
        db_id: &DatabaseId,
        entry: &DatabaseEntry,
        sql: String,
    ) -> Result<QueryResponse, OrchestrationError> {
        let snapshot = self.load_schema(entry).await.ok();
        let validated = validator::validate(&sql, &entry.policy, snapshot.as_ref()).map_err(|e| {
            self.record_rejection(&e);
            OrchestrationError::Validation(e)
        })?;

        let result = self.execute_validated(db_id, entry, &validated.rewritten_sql).await?;

        Ok(QueryResponse {
            sql_executed: validated.rewritten_sql,
            result,
            tokens_used: 0,
            warning: None,
        })
    }

    async fn execute_nl(
        &self,
        db_id: &DatabaseId,
        entry: &DatabaseEntry,
        prompt: &str,
        max_attempts: u32,
    ) -> Result<QueryResponse, OrchestrationError> {
        // 3. LoadSchema
        let snapshot = self.load_schema(entry).await.map_err(OrchestrationError::Execution)?;

        let mut correction: Option<String> = None;
        let mut total_tokens: u32 = 0;

        for attempt in 0..max_attempts {
            // 4. GenerateLoop
            let request = build_prompt(prompt, &snapshot, correction.as_deref());
            let completion = self.call_llm(&request).await?;
            total_tokens += completion.prompt_tokens + completion.completion_tokens;

            let candidate_sql = match extract_sql(&completion.content) {
                Ok(sql) => sql,
                Err(e) => {
                    correction = Some(format!("the previous response could not be parsed as SQL: {e}"));
                    continue;
                }
            };

            // 5. Validate; a failure here feeds back into the next attempt.
            let validated = match validator::validate(&candidate_sql, &entry.policy, Some(&snapshot)) {
                Ok(v) => v,
                Err(e) => {
                    self.record_rejection(&e);
                    correction = Some(e.to_string());
                    continue;
                }
            };

            // 6. Execute
            let result = self.execute_validated(db_id, entry, &validated.rewritten_sql).await?;

            // 7. Score
            let score = result_validator::score(prompt, &validated.rewritten_sql, &result, entry.policy.confidence_threshold);
            if score.acceptable || attempt + 1 == max_attempts {
                let warning = if score.acceptable {
                    None
                } else {
                    Some(format!("low-confidence result: {}", score.reasons.join("; ")))
                };
                return Ok(QueryResponse {
                    sql_executed: validated.rewritten_sql,
                    result,
                    tokens_used: total_tokens,
                    warning,
                });
            }
            correction = Some(format!("the previous result looked implausible: {}", score.reasons.join("; ")));
        }

        Err(OrchestrationError::GenerationExhausted { attempts: max_attempts })
    }

    async fn call_llm(
        &self,
        request: &crate::generator::CompletionRequest,
    ) -> Result<crate::generator::CompletionResponse, OrchestrationError> {
        let limiter = self.rate_limiters.get("llm").expect("llm rate limiter configured");
        let breaker = self.circuit_breakers.get_or_create("llm");
        let started = Instant::now();

        let _permit = limiter.acquire().await.map_err(OrchestrationError::RateLimit)?;
        let probe = breaker.try_acquire("llm").map_err(OrchestrationError::Circuit)?;

        let retry_policy = self.retry_policy;
        let result = retry::retry(&retry_policy, |_attempt| {
            let request = request.clone();
            async move {
                match self.llm_client.complete(request).await {
                    Ok(resp) => Outcome::Success(resp),
                    Err(e) if e.retryable() => Outcome::Retryable(e),
                    Err(e) => Outcome::Fatal(e),
                }
            }
        })
        .await;

        self.metrics.llm_calls_total.with_label_values(&["generate_sql"]).inc();
        self.metrics
            .llm_latency_seconds
            .with_label_values(&["generate_sql"])
            .observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(resp) => {
                self.metrics
                    .llm_tokens_used
                    .with_label_values(&["generate_sql"])
                    .inc_by((resp.prompt_tokens + resp.completion_tokens) as u64);
                breaker.record_success(probe);
            }
            Err(_) => breaker.record_failure(probe),
        }

        result.map_err(OrchestrationError::Generation)
    }

    async fn execute_validated(
        &self,
        db_id: &DatabaseId,
        entry: &DatabaseEntry,
        sql: &str,
    ) -> Result<QueryResult, OrchestrationError> {
        let limiter = self.rate_limiters.get("query").expect("query rate limiter configured");
        let breaker = self.circuit_breakers.get_or_create(db_id.as_str());

        let _permit = limiter.acquire().await.map_err(OrchestrationError::RateLimit)?;
        let probe = breaker.try_acquire(db_id.as_str()).map_err(OrchestrationError::Circuit)?;

        let retry_policy = self.retry_policy;
        let result = retry::retry(&retry_policy, |_attempt| async {
            match entry.executor.execute(sql, &entry.policy, None).await {
                Ok(r) => Outcome::Success(r),
                Err(e) if e.retryable() => Outcome::Retryable(e),
                Err(e) => Outcome::Fatal(e),
            }
        })
        .await;

        match &result {
            Ok(_) => breaker.record_success(probe),
            Err(_) => breaker.record_failure(probe),
        }

        result.map_err(OrchestrationError::Execution)
    }

    fn record_rejection(&self, err: &ValidationError) {
        self.metrics
            .sql_rejected_total
            .with_label_values(&[err.sub_code.as_str()])
            .inc();
        warn!(sub_code = err.sub_code.as_str(), "SQL rejected by validator");
    }

    /// Fetch (or return the cached) schema snapshot for `entry`, borrowing a
    /// pooled connection only for the duration of a cache-miss refresh.
    async fn load_schema(&self, entry: &DatabaseEntry) -> Result<crate::schema::SchemaSnapshot, ExecutionError> {
        let client = entry
            .executor
            .pool()
            .get()
            .await
            .map_err(|e| ExecutionError::ConnectionLost(e.to_string()))?;
        entry.schema_cache.get(&*client).await
    }
}
