//! Query Executor Lambda - runs analytical SQL on Athena.
//!
//! Submits the query, polls until it settles, and returns the result rows
//! (header row first). Successful queries are recorded in the query-history
//! store so they can be retrieved as few-shot exemplars later; recording is
//! best effort and never fails the response.

use aws_sdk_athena::types::QueryExecutionState;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{EmbeddingClient, QueryHistoryStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct QueryEvent {
    query: Option<String>,
    user_prompt: Option<String>,
}

struct AppState {
    athena_client: aws_sdk_athena::Client,
    history: QueryHistoryStore,
    database: String,
    output_location: String,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let database = std::env::var("ATHENA_DATABASE").map_err(|_| "ATHENA_DATABASE not set")?;
        let output_location =
            std::env::var("ATHENA_OUTPUT").map_err(|_| "ATHENA_OUTPUT not set")?;
        let lancedb_bucket =
            std::env::var("LANCE_DB_BUCKET").map_err(|_| "LANCE_DB_BUCKET not set")?;

        let embeddings =
            EmbeddingClient::new(aws_sdk_bedrockruntime::Client::new(&aws_config));
        let history = QueryHistoryStore::new(
            format!("s3://{}/lancedb", lancedb_bucket),
            embeddings,
        );

        Ok(Self {
            athena_client: aws_sdk_athena::Client::new(&aws_config),
            history,
            database,
            output_location,
        })
    }

    /// Run the query to completion and return all result rows, header first.
    async fn run_query(&self, query: &str) -> Result<Vec<Vec<String>>, QueryFailure> {
        let response = self
            .athena_client
            .start_query_execution()
            .query_string(query)
            .query_execution_context(
                aws_sdk_athena::types::QueryExecutionContext::builder()
                    .database(&self.database)
                    .build(),
            )
            .result_configuration(
                aws_sdk_athena::types::ResultConfiguration::builder()
                    .output_location(&self.output_location)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| QueryFailure(format!("Failed to start query: {}", e)))?;

        let execution_id = response
            .query_execution_id()
            .ok_or_else(|| QueryFailure("No query execution id returned".to_string()))?
            .to_string();

        // Poll once per second until the query settles
        let state = loop {
            let status = self
                .athena_client
                .get_query_execution()
                .query_execution_id(&execution_id)
                .send()
                .await
                .map_err(|e| QueryFailure(format!("Failed to poll query: {}", e)))?;

            let execution = status
                .query_execution()
                .ok_or_else(|| QueryFailure("Query execution missing from poll".to_string()))?;

            match execution.status().and_then(|s| s.state()) {
                Some(QueryExecutionState::Succeeded) => break Ok(()),
                Some(QueryExecutionState::Failed) | Some(QueryExecutionState::Cancelled) => {
                    let reason = execution
                        .status()
                        .and_then(|s| s.state_change_reason())
                        .unwrap_or("no reason given");
                    break Err(QueryFailure(format!("Athena query failed: {}", reason)));
                }
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };
        state?;

        let results = self
            .athena_client
            .get_query_results()
            .query_execution_id(&execution_id)
            .send()
            .await
            .map_err(|e| QueryFailure(format!("Failed to fetch results: {}", e)))?;

        let rows = results
            .result_set()
            .map(|rs| {
                rs.rows()
                    .iter()
                    .map(|row| {
                        row.data()
                            .iter()
                            .map(|datum| datum.var_char_value().unwrap_or_default().to_string())
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(rows)
    }
}

/// Human-readable Athena failure carried back as a 500 body.
struct QueryFailure(String);

async fn handler(state: Arc<AppState>, event: LambdaEvent<QueryEvent>) -> Result<Value, Error> {
    let (payload, _context) = event.into_parts();

    let query = match payload.query.as_deref().filter(|q| !q.is_empty()) {
        Some(q) => q.to_string(),
        None => {
            return Ok(json!({
                "statusCode": 400,
                "body": "Missing 'query' in event."
            }));
        }
    };

    info!(database = %state.database, query = %query, "Executing Athena query");

    let rows = match state.run_query(&query).await {
        Ok(rows) => rows,
        Err(QueryFailure(message)) => {
            error!("{}", message);
            return Ok(json!({
                "statusCode": 500,
                "body": { "error": message }
            }));
        }
    };

    // Header row is not a result
    let returned_rows = rows.len().saturating_sub(1) as i64;

    if let Some(prompt) = payload.user_prompt.as_deref().filter(|p| !p.is_empty()) {
        if let Err(e) = state
            .history
            .record_successful_query(prompt, &query, returned_rows)
            .await
        {
            error!("Failed to record query history: {}", e);
        }
    }

    Ok(json!({
        "statusCode": 200,
        "body": { "query": query, "rows": rows }
    }))
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
    fn test_parse_query_event() {
        let event: QueryEvent = serde_json::from_str(
            r#"{"query": "SELECT 1", "user_prompt": "how many workouts"}"#,
        )
        .unwrap();
        assert_eq!(event.query.as_deref(), Some("SELECT 1"));
        assert_eq!(event.user_prompt.as_deref(), Some("how many workouts"));
    }

    #[test]
    fn test_parse_query_event_without_prompt() {
        let event: QueryEvent = serde_json::from_str(r#"{"query": "SELECT 1"}"#).unwrap();
        assert!(event.user_prompt.is_none());
    }

    #[test]
    fn test_returned_rows_excludes_header() {
        let rows: Vec<Vec<String>> = vec![
            vec!["reps".to_string()],
            vec!["10".to_string()],
            vec!["12".to_string()],
        ];
        assert_eq!(rows.len().saturating_sub(1), 2);

        let empty: Vec<Vec<String>> = vec![];
        assert_eq!(empty.len().saturating_sub(1), 0);
    }
}
