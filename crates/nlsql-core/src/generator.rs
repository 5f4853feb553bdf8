//! SQL Generator (C4): turns a natural-language prompt into a candidate SQL
//! statement via an async completion call, on top of a schema summary.

use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::schema::SchemaSnapshot;

/// The LLM call contract consumed by the orchestrator: `{system, user,
/// temperature, max_tokens} -> {content, prompt_tokens, completion_tokens}`.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GenerationError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A reqwest-based `LlmClient` speaking the Anthropic Messages API, grounded
/// on the same status-code-to-error mapping the rest of the stack uses for
/// its LLM calls: 4xx/5xx map to a distinct kind, with 429/5xx/network
/// failures treated as transient (retryable) and everything else permanent.
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            model: model.into(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("building the reqwest client cannot fail with these options"),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    system: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GenerationError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = AnthropicRequest {
            model: &self.model,
            system: &request.system,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.user,
            }],
        };

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::LlmTransient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| GenerationError::MalformedOutput { raw: e.to_string() })?;

            let content = parsed
                .content
                .into_iter()
                .filter_map(|b| match b {
                    AnthropicContentBlock::Text { text } => Some(text),
                    AnthropicContentBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("");

            return Ok(CompletionResponse {
                content,
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
            });
        }

        let is_transient = status.as_u16() == 429 || status.is_server_error();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<AnthropicErrorBody>(&text)
            .map(|b| b.error.message)
            .unwrap_or(text);

        if is_transient {
            Err(GenerationError::LlmTransient(message))
        } else {
            Err(GenerationError::MalformedOutput { raw: message })
        }
    }
}

/// Build the system/user prompt for a generation attempt, optionally folding
/// in a prior validator rejection or executor result summary as corrective
/// feedback from a prior failed attempt.
pub fn build_prompt(
    nl_prompt: &str,
    snapshot: &SchemaSnapshot,
    correction: Option<&str>,
) -> CompletionRequest {
    let schema_summary = summarize_schema(snapshot);
    let mut user = format!(
        "Schema:\n{schema_summary}\n\nWrite a single read-only PostgreSQL SELECT statement \
         that answers this request:\n{nl_prompt}\n\nRespond with only the SQL statement."
    );
    if let Some(correction) = correction {
        user.push_str(&format!(
            "\n\nYour previous attempt was rejected or scored unacceptable: {correction}\n\
             Produce a corrected statement."
        ));
    }

    CompletionRequest {
        system: "You translate natural-language questions into a single PostgreSQL SELECT \
                 statement over the given schema. Never produce DDL or DML."
            .to_string(),
        user,
        temperature: 0.0,
        max_tokens: 1024,
    }
}

/// Character budget for the schema summary folded into a generation prompt.
/// Past this cap, remaining tables are dropped rather than truncating mid-line,
/// so the summary is always valid even when a database has hundreds of tables.
const SCHEMA_SUMMARY_CHAR_BUDGET: usize = 8000;

fn summarize_schema(snapshot: &SchemaSnapshot) -> String {
    let mut tables = snapshot.schema.tables.iter().collect::<Vec<_>>();
    tables.sort_by(|a, b| (a.schema.as_str(), a.name.as_str()).cmp(&(b.schema.as_str(), b.name.as_str())));

    let mut summary = String::new();
    for t in tables {
        let mut columns = t.columns.iter().collect::<Vec<_>>();
        columns.sort_by(|a, b| a.name.cmp(&b.name));

        let cols = columns
            .iter()
            .map(|c| if c.is_primary_key { format!("{}*", c.name) } else { c.name.clone() })
            .collect::<Vec<_>>()
            .join(", ");
        let line = format!("{}.{}({})", t.schema, t.name, cols);

        let needed = if summary.is_empty() { line.len() } else { line.len() + 1 };
        if summary.len() + needed > SCHEMA_SUMMARY_CHAR_BUDGET {
            break;
        }
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str(&line);
    }
    summary
}

/// Extract the SQL statement from an LLM completion: strips Markdown fences
/// if present and a single trailing semicolon.
pub fn extract_sql(content: &str) -> Result<String, GenerationError> {
    let trimmed = content.trim();
    let unfenced = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("sql").unwrap_or(rest);
        rest.trim_end_matches("```").trim()
    } else {
        trimmed
    };

    let sql = unfenced.trim().trim_end_matches(';').trim();
    if sql.is_empty() {
        return Err(GenerationError::MalformedOutput {
            raw: content.to_string(),
        });
    }
    Ok(sql.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlsql_check::{ColumnInfo, DbSchema, RelationKind, TableInfo};
    use std::sync::Arc;
    use std::time::Instant;

    fn column(name: &str, is_primary_key: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: "text".to_string(),
            is_nullable: !is_primary_key,
            is_primary_key,
            ordinal: 0,
        }
    }

    fn snapshot(tables: Vec<TableInfo>) -> SchemaSnapshot {
        SchemaSnapshot {
            schema: Arc::new(DbSchema { schemas: vec!["public".to_string()], tables }),
            fetched_at: Instant::now(),
        }
    }

    #[test]
    fn summary_marks_primary_keys_and_sorts_tables_and_columns() {
        let snap = snapshot(vec![
            TableInfo {
                schema: "public".to_string(),
                name: "zebras".to_string(),
                kind: RelationKind::Table,
                columns: vec![column("name", false), column("id", true)],
            },
            TableInfo {
                schema: "public".to_string(),
                name: "apples".to_string(),
                kind: RelationKind::Table,
                columns: vec![column("id", true)],
            },
        ]);

        let summary = summarize_schema(&snap);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "public.apples(id*)");
        assert_eq!(lines[1], "public.zebras(id*, name)");
    }

    #[test]
    fn summary_is_truncated_to_the_character_budget() {
        let tables = (0..2000)
            .map(|i| TableInfo {
                schema: "public".to_string(),
                name: format!("t{i:05}"),
                kind: RelationKind::Table,
                columns: vec![column("id", true)],
            })
            .collect();

        let summary = summarize_schema(&snapshot(tables));
        assert!(summary.len() <= SCHEMA_SUMMARY_CHAR_BUDGET);
    }

    #[test]
    fn extracts_sql_from_fenced_block() {
        let content = "```sql\nSELECT 1;\n```";
        assert_eq!(extract_sql(content).unwrap(), "SELECT 1");
    }

    #[test]
    fn extracts_plain_sql() {
        assert_eq!(extract_sql("SELECT 1;").unwrap(), "SELECT 1");
    }

    #[test]
    fn empty_completion_is_malformed() {
        assert!(extract_sql("   ").is_err());
    }
}
