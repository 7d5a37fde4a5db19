//! Agent Lambda - turns free-text questions into Athena queries.
//!
//! Runs a Bedrock Converse tool loop with two tools: one fetches the Glue
//! table schemas (plus past successful queries as few-shot exemplars), the
//! other executes SQL on Athena via the query-executor Lambda. The loop ends
//! when the model produces a plain text answer.

use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, InferenceConfiguration, Message, StopReason,
    SystemContentBlock, Tool, ToolConfiguration, ToolInputSchema, ToolResultBlock,
    ToolResultContentBlock, ToolSpecification, ToolUseBlock,
};
use aws_smithy_types::{Document, Number};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::query_history::format_exemplars;
use shared::{LambdaInvoker, QueryHistoryRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Upper bound on reasoning/tool turns for one question.
const MAX_TURNS: usize = 10;

const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-haiku-20240307-v1:0";

const SYSTEM_PROMPT: &str = "\
You are a data assistant specialized in analyzing AWS Glue tables via Athena using Trino SQL syntax.

CRITICAL RULES (STRICT):
- You have access to TWO tools:
    - `get_table_schema`: retrieves schemas for the workout tables and examples of past successful queries
    - `execute_athena_query`: runs SQL queries against the Athena database
- You MUST ALWAYS call `get_table_schema` FIRST to get the exact table names and columns before writing any queries.
- You MUST use the tools to answer the user's question. NEVER answer directly or speculate.
- Only provide a final answer after you have called the tools and have all the necessary data.
- If the Athena query returns no results or an empty table, respond: 'Sorry, I cannot answer this question based on the available data.' Do NOT make up an answer.

Your workflow:
1. Call `get_table_schema` to get table and column info.
2. Use that info to construct a correct SQL query and call `execute_athena_query`.
3. Only after receiving results from the tools, provide a final answer in a clear, human-readable format (not JSON or code blocks).";

#[derive(Debug, Deserialize)]
struct AgentEvent {
    /// REST-style invocation: JSON string or object with a `query` field
    body: Option<Value>,
    /// Direct invocation with a bare prompt
    prompt: Option<String>,
}

impl AgentEvent {
    fn question(&self) -> Option<String> {
        if let Some(prompt) = self.prompt.as_ref().filter(|p| !p.is_empty()) {
            return Some(prompt.clone());
        }
        let body = self.body.as_ref()?;
        let parsed: Value = match body {
            Value::String(raw) => serde_json::from_str(raw).ok()?,
            other => other.clone(),
        };
        parsed
            .get("query")
            .and_then(|q| q.as_str())
            .filter(|q| !q.is_empty())
            .map(String::from)
    }
}

struct AppState {
    bedrock_client: aws_sdk_bedrockruntime::Client,
    invoker: LambdaInvoker,
    model_id: String,
    schema_function: String,
    query_function: String,
    /// Schema tool responses survive for the lifetime of the execution
    /// environment, like the rest of the warm state.
    schema_cache: RwLock<Option<String>>,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let model_id =
            std::env::var("BEDROCK_MODEL_ID").unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        let schema_function = std::env::var("SCHEMA_FUNCTION_NAME")
            .unwrap_or_else(|_| "silka-table-schema".to_string());
        let query_function = std::env::var("QUERY_FUNCTION_NAME")
            .unwrap_or_else(|_| "silka-query-executor".to_string());

        Ok(Self {
            bedrock_client: aws_sdk_bedrockruntime::Client::new(&aws_config),
            invoker: LambdaInvoker::new(aws_sdk_lambda::Client::new(&aws_config)),
            model_id,
            schema_function,
            query_function,
            schema_cache: RwLock::new(None),
        })
    }

    /// Tool: fetch Glue schemas and past-query exemplars, formatted for the
    /// model. Cached in-process.
    async fn get_table_schema(&self, prompt: &str) -> String {
        {
            let cache = self.schema_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                return cached.clone();
            }
        }

        let response = match self
            .invoker
            .get_table_schema(&self.schema_function, prompt)
            .await
        {
            Ok(response) => response,
            Err(e) => return format!("ERROR: Failed to fetch table schemas: {}", e),
        };

        let Some(body) = response.get("body").filter(|b| b.is_object()) else {
            return format!("ERROR: Malformed schema response: {}", response);
        };

        let formatted = format_schema_response(body);

        let mut cache = self.schema_cache.write().await;
        *cache = Some(formatted.clone());
        formatted
    }

    /// Tool: run SQL on Athena via the query-executor Lambda. Failures come
    /// back as sentinel `ERROR:` strings for the model, never as errors.
    async fn execute_athena_query(&self, query: &str, user_prompt: &str) -> String {
        let response = match self
            .invoker
            .execute_query(&self.query_function, query, user_prompt)
            .await
        {
            Ok(response) => response,
            Err(e) => return format!("ERROR: Empty response from Lambda for query:\n{}\n{}", query, e),
        };

        format_query_response(query, &response)
    }

    async fn dispatch_tool(&self, tool_use: &ToolUseBlock, user_prompt: &str) -> String {
        let args = document_to_value(tool_use.input());
        match tool_use.name() {
            "get_table_schema" => self.get_table_schema(user_prompt).await,
            "execute_athena_query" => {
                let query = args
                    .get("query")
                    .and_then(|q| q.as_str())
                    .unwrap_or_default();
                if query.is_empty() {
                    "ERROR: Tool call missing 'query' argument.".to_string()
                } else {
                    self.execute_athena_query(query, user_prompt).await
                }
            }
            other => format!("ERROR: Unknown tool '{}'.", other),
        }
    }

    /// Run the Converse tool loop until the model answers in plain text.
    async fn answer(&self, question: &str) -> Result<String, Error> {
        let tool_config = tool_configuration()?;
        let mut messages = vec![Message::builder()
            .role(ConversationRole::User)
            .content(ContentBlock::Text(question.to_string()))
            .build()
            .map_err(|e| format!("Failed to build message: {}", e))?];

        for turn in 0..MAX_TURNS {
            let response = self
                .bedrock_client
                .converse()
                .model_id(&self.model_id)
                .system(SystemContentBlock::Text(SYSTEM_PROMPT.to_string()))
                .set_messages(Some(messages.clone()))
                .tool_config(tool_config.clone())
                .inference_config(
                    InferenceConfiguration::builder()
                        .temperature(0.1)
                        .max_tokens(4096)
                        .build(),
                )
                .send()
                .await
                .map_err(|e| format!("Bedrock converse failed: {}", e))?;

            let message = response
                .output()
                .and_then(|output| output.as_message().ok())
                .ok_or("No message in Bedrock response")?
                .clone();
            messages.push(message.clone());

            if response.stop_reason() == &StopReason::ToolUse {
                let mut results = Vec::new();
                for block in message.content() {
                    if let ContentBlock::ToolUse(tool_use) = block {
                        info!(turn, tool = %tool_use.name(), "Agent requested tool");
                        let result = self.dispatch_tool(tool_use, question).await;
                        results.push(ContentBlock::ToolResult(
                            ToolResultBlock::builder()
                                .tool_use_id(tool_use.tool_use_id())
                                .content(ToolResultContentBlock::Text(result))
                                .build()
                                .map_err(|e| format!("Failed to build tool result: {}", e))?,
                        ));
                    }
                }
                messages.push(
                    Message::builder()
                        .role(ConversationRole::User)
                        .set_content(Some(results))
                        .build()
                        .map_err(|e| format!("Failed to build message: {}", e))?,
                );
                continue;
            }

            let answer: String = message
                .content()
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");

            info!(turn, "Agent produced final answer");
            return Ok(answer);
        }

        warn!("Agent hit the turn limit without a final answer");
        Ok("Sorry, I could not complete the analysis. Please try again.".to_string())
    }
}

/// Format the schema Lambda body into the tool result text.
fn format_schema_response(body: &Value) -> String {
    let mut sections = Vec::new();

    if let Some(tables) = body.as_object() {
        for (label, table) in tables {
            if label == "relevant_chunks" {
                continue;
            }
            let table_name = table
                .get("table_name")
                .and_then(|n| n.as_str())
                .unwrap_or(label);
            let empty = Vec::new();
            let columns = table
                .get("columns")
                .and_then(|c| c.as_array())
                .unwrap_or(&empty);

            let data_types = columns
                .iter()
                .map(|col| {
                    format!(
                        "- {}: {}",
                        col.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                        col.get("type").and_then(|v| v.as_str()).unwrap_or(""),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            let comments = columns
                .iter()
                .map(|col| {
                    let comment = col
                        .get("comment")
                        .and_then(|v| v.as_str())
                        .filter(|c| !c.is_empty())
                        .unwrap_or("no comment");
                    format!(
                        "- {}: {}",
                        col.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                        comment,
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");

            sections.push(format!(
                "Table `{}` ({}):\nData Types:\n{}\nComments:\n{}",
                table_name, label, data_types, comments
            ));
        }
    }

    // Past successful queries ride along as few-shot exemplars
    if let Some(chunks) = body.get("relevant_chunks") {
        if let Ok(records) = serde_json::from_value::<Vec<QueryHistoryRecord>>(chunks.clone()) {
            if !records.is_empty() {
                sections.push(format!(
                    "Examples of past successful queries:\n\n{}",
                    format_exemplars(&records)
                ));
            }
        }
    }

    sections.join("\n\n")
}

/// Format the query-executor Lambda response into the tool result text.
fn format_query_response(query: &str, response: &Value) -> String {
    if response.is_null() {
        return format!("ERROR: Empty response from Lambda for query:\n{}", query);
    }

    let Some(body) = response.get("body") else {
        return format!(
            "ERROR: Athena query failed or returned no response.\nQuery:\n{}\nRaw Lambda response:\n{}",
            query, response
        );
    };

    let Some(rows) = body.get("rows").and_then(|r| r.as_array()) else {
        return format!(
            "ERROR: Athena query failed or returned no rows.\nQuery:\n{}\nError:\n{}",
            query, body
        );
    };

    // First row is the header
    let formatted_rows = rows
        .iter()
        .skip(1)
        .map(|row| {
            row.as_array()
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| cell.as_str().unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("Results for query:\n{}\n\n{}", query, formatted_rows)
}

fn tool_configuration() -> Result<ToolConfiguration, Error> {
    let schema_tool = ToolSpecification::builder()
        .name("get_table_schema")
        .description(
            "Return schemas for the workout tables: table name, column names, types, and \
             comments, plus examples of past successful queries.",
        )
        .input_schema(ToolInputSchema::Json(to_document(&json!({
            "type": "object",
            "properties": {},
        }))))
        .build()
        .map_err(|e| format!("Failed to build tool spec: {}", e))?;

    let query_tool = ToolSpecification::builder()
        .name("execute_athena_query")
        .description("Execute a SQL query on AWS Athena and return the results as a formatted string.")
        .input_schema(ToolInputSchema::Json(to_document(&json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The Trino SQL query to execute"
                }
            },
            "required": ["query"],
        }))))
        .build()
        .map_err(|e| format!("Failed to build tool spec: {}", e))?;

    ToolConfiguration::builder()
        .tools(Tool::ToolSpec(schema_tool))
        .tools(Tool::ToolSpec(query_tool))
        .build()
        .map_err(|e| format!("Failed to build tool config: {}", e).into())
}

/// serde_json -> smithy Document, for tool input schemas.
fn to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= 0 {
                    Document::Number(Number::PosInt(i as u64))
                } else {
                    Document::Number(Number::NegInt(i))
                }
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or_default()))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_document(v)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}

/// smithy Document -> serde_json, for tool call arguments.
fn document_to_value(document: &Document) -> Value {
    match document {
        Document::Null => Value::Null,
        Document::Bool(b) => Value::Bool(*b),
        Document::Number(Number::PosInt(i)) => json!(*i),
        Document::Number(Number::NegInt(i)) => json!(*i),
        Document::Number(Number::Float(f)) => json!(*f),
        Document::String(s) => Value::String(s.clone()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_value).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_value(v)))
                .collect(),
        ),
    }
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<AgentEvent>) -> Result<Value, Error> {
    let (payload, _context) = event.into_parts();

    let Some(question) = payload.question() else {
        return Ok(json!({
            "statusCode": 400,
            "body": "Missing 'query' in event."
        }));
    };

    info!(question = %question, "Received question");

    match state.answer(&question).await {
        Ok(answer) => Ok(json!({ "statusCode": 200, "body": answer })),
        Err(e) => {
            error!("Agent execution failed: {}", e);
            Ok(json!({
                "statusCode": 500,
                "body": format!("Agent execution failed: {}", e)
            }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let state = Arc::new(AppState::new().await?);

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_from_json_string_body() {
        let event: AgentEvent = serde_json::from_value(json!({
            "body": "{\"query\": \"total reps in 2023?\"}"
        }))
        .unwrap();
        assert_eq!(event.question().as_deref(), Some("total reps in 2023?"));
    }

    #[test]
    fn test_question_from_object_body_and_prompt() {
        let event: AgentEvent = serde_json::from_value(json!({
            "body": {"query": "heaviest deadlift?"}
        }))
        .unwrap();
        assert_eq!(event.question().as_deref(), Some("heaviest deadlift?"));

        let direct: AgentEvent = serde_json::from_value(json!({"prompt": "how many sets?"})).unwrap();
        assert_eq!(direct.question().as_deref(), Some("how many sets?"));

        let empty: AgentEvent = serde_json::from_value(json!({})).unwrap();
        assert!(empty.question().is_none());
    }

    #[test]
    fn test_format_query_response_rows() {
        let response = json!({
            "statusCode": 200,
            "body": {
                "query": "SELECT reps FROM sets",
                "rows": [["reps"], ["10"], ["12"]]
            }
        });
        let formatted = format_query_response("SELECT reps FROM sets", &response);
        assert!(formatted.starts_with("Results for query:"));
        assert!(formatted.contains("10"));
        assert!(!formatted.contains("reps\n10")); // header row skipped
    }

    #[test]
    fn test_format_query_response_errors() {
        let no_body = json!({"statusCode": 500});
        assert!(format_query_response("SELECT 1", &no_body).starts_with("ERROR:"));

        let failed = json!({"statusCode": 500, "body": {"error": "SYNTAX_ERROR"}});
        let formatted = format_query_response("SELECT 1", &failed);
        assert!(formatted.starts_with("ERROR:"));
        assert!(formatted.contains("SYNTAX_ERROR"));
    }

    #[test]
    fn test_format_schema_response() {
        let body = json!({
            "sets": {
                "table_name": "sets",
                "columns": [
                    {"name": "weight_kg", "type": "double", "comment": ""},
                    {"name": "reps", "type": "bigint", "comment": "repetitions"}
                ]
            },
            "relevant_chunks": [{
                "user_prompt": "total reps in 2023",
                "query_id": "q1",
                "sql_query": "SELECT SUM(reps) FROM sets",
                "tables_used": ["sets"],
                "columns_used": ["reps"],
                "query_type": ["SELECT"],
                "returned_rows": 1,
                "timestamp": "2024-03-01T10:00:00Z"
            }]
        });
        let formatted = format_schema_response(&body);
        assert!(formatted.contains("Table `sets` (sets):"));
        assert!(formatted.contains("- weight_kg: double"));
        assert!(formatted.contains("- weight_kg: no comment"));
        assert!(formatted.contains("Examples of past successful queries:"));
        assert!(formatted.contains("SELECT SUM(reps) FROM sets"));
    }

    #[test]
    fn test_document_round_trip() {
        let value = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        });
        assert_eq!(document_to_value(&to_document(&value)), value);
    }
}
