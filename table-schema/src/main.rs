//! Table Schema Lambda - Glue catalog schemas plus historical exemplars.
//!
//! Returns the column schemas of the workout tables and, when a prompt is
//! supplied, the nearest historical queries from the query-history store.

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{EmbeddingClient, QueryHistoryRecord, QueryHistoryStore};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tables exposed to the agent.
const TABLE_NAMES: [&str; 4] = ["workouts", "exercises", "sets", "exercise_descriptions"];

/// Number of historical queries returned alongside the schemas.
const EXEMPLAR_COUNT: usize = 5;

#[derive(Debug, Deserialize)]
struct SchemaEvent {
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct ColumnSchema {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    comment: String,
}

#[derive(Debug, Serialize)]
struct TableSchema {
    table_name: String,
    columns: Vec<ColumnSchema>,
}

struct AppState {
    glue_client: aws_sdk_glue::Client,
    history: QueryHistoryStore,
    database_name: String,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        // The Glue database is named after the account id
        let sts_client = aws_sdk_sts::Client::new(&aws_config);
        let identity = sts_client
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| format!("Failed to resolve account id: {}", e))?;
        let account_id = identity.account().ok_or("No account id in STS response")?;
        let database_name = format!("{}_workouts_database", account_id);

        let lancedb_bucket =
            std::env::var("LANCE_DB_BUCKET").map_err(|_| "LANCE_DB_BUCKET not set")?;
        let embeddings =
            EmbeddingClient::new(aws_sdk_bedrockruntime::Client::new(&aws_config));
        let history = QueryHistoryStore::new(
            format!("s3://{}/lancedb", lancedb_bucket),
            embeddings,
        );

        Ok(Self {
            glue_client: aws_sdk_glue::Client::new(&aws_config),
            history,
            database_name,
        })
    }

    async fn table_schema(&self, table_name: &str) -> Result<TableSchema, Error> {
        let response = self
            .glue_client
            .get_table()
            .database_name(&self.database_name)
            .name(table_name)
            .send()
            .await
            .map_err(|e| format!("Failed to fetch Glue table {}: {}", table_name, e))?;

        let columns = response
            .table()
            .and_then(|t| t.storage_descriptor())
            .map(|sd| sd.columns())
            .unwrap_or_default()
            .iter()
            .map(|col| ColumnSchema {
                name: col.name().to_string(),
                column_type: col.r#type().unwrap_or_default().to_string(),
                comment: col.comment().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(TableSchema {
            table_name: table_name.to_string(),
            columns,
        })
    }

    /// Nearest historical queries for the prompt; empty on any store miss.
    async fn relevant_chunks(&self, prompt: Option<&str>) -> Vec<QueryHistoryRecord> {
        let Some(prompt) = prompt.filter(|p| !p.is_empty()) else {
            return Vec::new();
        };

        match self.history.retrieve_similar(prompt, EXEMPLAR_COUNT).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Query history retrieval failed: {}", e);
                Vec::new()
            }
        }
    }
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<SchemaEvent>) -> Result<Value, Error> {
    let (payload, _context) = event.into_parts();

    let mut body = serde_json::Map::new();
    for table_name in TABLE_NAMES {
        let schema = state.table_schema(table_name).await?;
        body.insert(table_name.to_string(), serde_json::to_value(schema)?);
    }

    let chunks = state.relevant_chunks(payload.prompt.as_deref()).await;
    info!(
        database = %state.database_name,
        exemplars = chunks.len(),
        "Resolved table schemas"
    );
    body.insert("relevant_chunks".to_string(), serde_json::to_value(chunks)?);

    Ok(json!({
        "statusCode": 200,
        "body": Value::Object(body)
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
    fn test_table_schema_serialization() {
        let schema = TableSchema {
            table_name: "sets".to_string(),
            columns: vec![ColumnSchema {
                name: "weight_kg".to_string(),
                column_type: "double".to_string(),
                comment: "set weight in kilograms".to_string(),
            }],
        };
        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["table_name"], "sets");
        assert_eq!(value["columns"][0]["type"], "double");
    }

    #[test]
    fn test_parse_schema_event() {
        let event: SchemaEvent = serde_json::from_str(r#"{"prompt": "total reps"}"#).unwrap();
        assert_eq!(event.prompt.as_deref(), Some("total reps"));

        let empty: SchemaEvent = serde_json::from_str(r#"{}"#).unwrap();
        assert!(empty.prompt.is_none());
    }
}
