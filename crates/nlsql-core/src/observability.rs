//! Observability (C9): request-scoped tracing spans, a field-redacting
//! `tracing_subscriber::fmt::FormatFields` implementation, and the
//! Prometheus metric series named in the external interface.

use std::collections::HashSet;
use std::fmt;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::field::{Field, Visit};
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::fmt::format::Writer;

use crate::policy::ObservabilityConfig;

/// One request's identity, threaded through every span it opens.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub database: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// All Prometheus series from the external interface, registered once and
/// shared across the orchestrator.
#[derive(Clone)]
pub struct Metrics {
    pub query_requests_total: IntCounterVec,
    pub query_duration_seconds: HistogramVec,
    pub llm_calls_total: IntCounterVec,
    pub llm_latency_seconds: HistogramVec,
    pub llm_tokens_used: IntCounterVec,
    pub sql_rejected_total: IntCounterVec,
    pub db_connections_active: IntGaugeVec,
    pub schema_cache_age_seconds: IntGaugeVec,
}

impl Metrics {
    /// Register every series against `registry`. Intended to be called once
    /// at startup with `prometheus::default_registry()` or a test-local one.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let query_requests_total = IntCounterVec::new(
            Opts::new("query_requests_total", "Total query requests handled"),
            &["status", "database"],
        )?;
        registry.register(Box::new(query_requests_total.clone()))?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new("query_duration_seconds", "Query request duration in seconds")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["database"],
        )?;
        registry.register(Box::new(query_duration_seconds.clone()))?;

        let llm_calls_total = IntCounterVec::new(
            Opts::new("llm_calls_total", "Total LLM calls made"),
            &["operation"],
        )?;
        registry.register(Box::new(llm_calls_total.clone()))?;

        let llm_latency_seconds = HistogramVec::new(
            HistogramOpts::new("llm_latency_seconds", "LLM call latency in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["operation"],
        )?;
        registry.register(Box::new(llm_latency_seconds.clone()))?;

        let llm_tokens_used = IntCounterVec::new(
            Opts::new("llm_tokens_used", "Total LLM tokens consumed"),
            &["operation"],
        )?;
        registry.register(Box::new(llm_tokens_used.clone()))?;

        let sql_rejected_total = IntCounterVec::new(
            Opts::new("sql_rejected_total", "Total SQL statements rejected by the validator"),
            &["reason"],
        )?;
        registry.register(Box::new(sql_rejected_total.clone()))?;

        let db_connections_active = IntGaugeVec::new(
            Opts::new("db_connections_active", "Active pooled connections per database"),
            &["database"],
        )?;
        registry.register(Box::new(db_connections_active.clone()))?;

        let schema_cache_age_seconds = IntGaugeVec::new(
            Opts::new("schema_cache_age_seconds", "Age of the cached schema snapshot per database"),
            &["database"],
        )?;
        registry.register(Box::new(schema_cache_age_seconds.clone()))?;

        Ok(Self {
            query_requests_total,
            query_duration_seconds,
            llm_calls_total,
            llm_latency_seconds,
            llm_tokens_used,
            sql_rejected_total,
            db_connections_active,
            schema_cache_age_seconds,
        })
    }
}

/// A `tracing_subscriber::fmt::FormatFields` implementation that replaces
/// the value of any field whose name matches `sensitive_fields`
/// (case-insensitively) with a fixed redaction token as it is rendered.
///
/// `tracing` gives a `Layer::on_event` no way to rewrite an event in flight,
/// so redaction has to happen in the formatter that actually produces the
/// log line rather than in a layer sitting beside it. Install this on the
/// `fmt` layer directly: `fmt::layer().fmt_fields(RedactionLayer::new(config))`.
pub struct RedactionLayer {
    sensitive_fields: HashSet<String>,
    redaction_token: String,
}

impl RedactionLayer {
    pub fn new(config: &ObservabilityConfig) -> Self {
        Self {
            sensitive_fields: config
                .sensitive_fields
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            redaction_token: config.redaction_token.clone(),
        }
    }

    fn is_sensitive(&self, field_name: &str) -> bool {
        let lname = field_name.to_ascii_lowercase();
        self.sensitive_fields.iter().any(|s| lname.contains(s.as_str()))
    }
}

impl<'writer> FormatFields<'writer> for RedactionLayer {
    fn format_fields<R: RecordFields>(&self, writer: Writer<'writer>, fields: R) -> fmt::Result {
        let mut visitor = RedactingVisitor {
            layer: self,
            writer,
            first: true,
            result: Ok(()),
        };
        fields.record(&mut visitor);
        visitor.result
    }
}

struct RedactingVisitor<'a, 'writer> {
    layer: &'a RedactionLayer,
    writer: Writer<'writer>,
    first: bool,
    result: fmt::Result,
}

impl RedactingVisitor<'_, '_> {
    fn write(&mut self, field: &Field, rendered: &dyn fmt::Display) {
        if self.result.is_err() {
            return;
        }
        let sep = if self.first { "" } else { " " };
        self.result = write!(self.writer, "{sep}{}={rendered}", field.name());
        self.first = false;
    }
}

impl Visit for RedactingVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.layer.is_sensitive(field.name()) {
            let token = self.layer.redaction_token.clone();
            self.write(field, &token);
        } else {
            self.write(field, &format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if self.layer.is_sensitive(field.name()) {
            let token = self.layer.redaction_token.clone();
            self.write(field, &token);
        } else {
            self.write(field, &value);
        }
    }
}

/// Redact a single string value directly, for callers building a `details`
/// map for an error response rather than a tracing event (error bodies
/// "never containing secrets — redaction is applied").
pub fn redact_field(config: &ObservabilityConfig, key: &str, value: &str) -> String {
    let lkey = key.to_ascii_lowercase();
    if config.sensitive_fields.iter().any(|s| lkey.contains(s.to_ascii_lowercase().as_str())) {
        config.redaction_token.clone()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ObservabilityConfig {
        ObservabilityConfig {
            json_logs: false,
            sensitive_fields: ["password", "token"].into_iter().map(String::from).collect(),
            redaction_token: "***REDACTED***".to_string(),
        }
    }

    #[test]
    fn redacts_matching_field() {
        assert_eq!(redact_field(&config(), "user_password", "hunter2"), "***REDACTED***");
    }

    #[test]
    fn leaves_non_sensitive_field_alone() {
        assert_eq!(redact_field(&config(), "username", "alice"), "alice");
    }

    #[test]
    fn metrics_register_without_collision() {
        let registry = Registry::new();
        let metrics = Metrics::register(&registry).unwrap();
        metrics
            .query_requests_total
            .with_label_values(&["ok", "main"])
            .inc();
        assert_eq!(registry.gather().len(), 8);
    }
}
