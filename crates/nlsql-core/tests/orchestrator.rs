//! End-to-end exercise of the orchestrator's eight-step state machine against
//! a live database. Requires `DATABASE_URL`; skips otherwise, matching the
//! rest of this workspace's live-database test convention.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nlsql_core::{
    CircuitBreakerRegistry, CompletionRequest, CompletionResponse, DatabaseId, DatabaseRegistration,
    GenerationError, LlmClient, Metrics, Orchestrator, QueryRequest, RateLimiter, RateLimiterRegistry,
    RequestContext, RetryPolicy, SchemaCache, SecurityPolicy, SqlExecutor, StarOnStaleMetadataPolicy, create_pool,
};

struct FixedSqlClient {
    sql: String,
}

#[async_trait::async_trait]
impl LlmClient for FixedSqlClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, GenerationError> {
        Ok(CompletionResponse {
            content: format!("```sql\n{}\n```", self.sql),
            prompt_tokens: 42,
            completion_tokens: 7,
        })
    }
}

fn policy() -> SecurityPolicy {
    SecurityPolicy {
        blocked_tables: HashSet::new(),
        blocked_columns: HashSet::new(),
        blocked_functions: HashSet::new(),
        allow_explain: false,
        max_rows: 100,
        max_execution_seconds: 5,
        readonly_role: None,
        safe_search_path: None,
        max_subquery_depth: 4,
        confidence_threshold: 0,
        reject_star_on_stale_metadata: StarOnStaleMetadataPolicy::Reject,
    }
}

async fn build_orchestrator(database_url: &str, llm_client: Arc<dyn LlmClient>) -> Orchestrator {
    let pool = create_pool(database_url, 4).expect("valid DATABASE_URL");
    let executor = SqlExecutor::new(pool);
    let schema_cache = SchemaCache::new(Duration::from_secs(30), vec!["public".to_string()]);

    let mut rate_limiters = std::collections::HashMap::new();
    rate_limiters.insert("query".to_string(), RateLimiter::new("query", 4, Duration::from_secs(5)));
    rate_limiters.insert("llm".to_string(), RateLimiter::new("llm", 4, Duration::from_secs(5)));

    let retry_policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        factor: 2.0,
        max_delay: Duration::from_millis(10),
        jitter: false,
    };

    let registry = prometheus::Registry::new();
    let metrics = Metrics::register(&registry).expect("unique metric names");

    Orchestrator::new(
        vec![DatabaseRegistration {
            id: DatabaseId::new("main"),
            executor,
            policy: policy(),
            schema_cache,
        }],
        llm_client,
        RateLimiterRegistry::new(rate_limiters),
        Arc::new(CircuitBreakerRegistry::new(3, Duration::from_secs(1))),
        retry_policy,
        3,
        metrics,
    )
}

fn database_url() -> Option<String> {
    match std::env::var("DATABASE_URL") {
        Ok(v) => Some(v),
        Err(_) => {
            eprintln!("DATABASE_URL is not set; skipping orchestrator integration tests");
            None
        }
    }
}

#[tokio::test]
async fn raw_sql_path_executes_and_returns_rows() {
    let Some(database_url) = database_url() else { return };
    let llm = Arc::new(FixedSqlClient { sql: "SELECT 1".to_string() });
    let orchestrator = build_orchestrator(&database_url, llm).await;

    let response = orchestrator
        .execute_query(
            QueryRequest {
                sql: Some("SELECT 1 AS one".to_string()),
                ..Default::default()
            },
            RequestContext::new("test-raw-sql"),
        )
        .await
        .expect("raw SELECT against a live database should succeed");

    assert_eq!(response.result.columns, vec!["one".to_string()]);
    assert_eq!(response.tokens_used, 0);
}

#[tokio::test]
async fn nl_path_runs_generate_validate_execute_loop() {
    let Some(database_url) = database_url() else { return };
    let llm = Arc::new(FixedSqlClient { sql: "SELECT 2 AS two".to_string() });
    let orchestrator = build_orchestrator(&database_url, llm).await;

    let response = orchestrator
        .execute_query(
            QueryRequest {
                prompt: Some("give me the number two".to_string()),
                ..Default::default()
            },
            RequestContext::new("test-nl"),
        )
        .await
        .expect("generated SQL should validate and execute");

    assert_eq!(response.result.columns, vec!["two".to_string()]);
    assert!(response.tokens_used > 0);
}

#[tokio::test]
async fn unresolvable_database_name_is_rejected_before_any_connection_use() {
    let Some(database_url) = database_url() else { return };
    let llm = Arc::new(FixedSqlClient { sql: "SELECT 1".to_string() });
    let orchestrator = build_orchestrator(&database_url, llm).await;

    let err = orchestrator
        .execute_query(
            QueryRequest {
                sql: Some("SELECT 1".to_string()),
                database: Some("does-not-exist".to_string()),
                ..Default::default()
            },
            RequestContext::new("test-bad-db"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "DatabaseNotFound");
}

#[tokio::test]
async fn generation_loop_exhausts_on_persistently_unparsable_output() {
    let Some(database_url) = database_url() else { return };

    struct GarbageClient;
    #[async_trait::async_trait]
    impl LlmClient for GarbageClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, GenerationError> {
            Ok(CompletionResponse {
                content: "   ".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
            })
        }
    }

    let orchestrator = build_orchestrator(&database_url, Arc::new(GarbageClient)).await;
    let err = orchestrator
        .execute_query(
            QueryRequest {
                prompt: Some("anything".to_string()),
                ..Default::default()
            },
            RequestContext::new("test-exhausted"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "GenerationExhausted");
}
