//! Workout Sync Lambda - SNS-triggered pipeline commands.
//!
//! Receives commands published by the Discord webhook Lambda and:
//! 1. Fetches workouts newer than the SSM watermark from the Hevy API
//! 2. Uploads raw JSON to S3 and registers each file in DynamoDB
//! 3. Replays stored workouts back to Discord on request
//!
//! Outcomes and errors are reported to the Discord webhook rather than
//! surfaced as Lambda failures.

use aws_sdk_dynamodb::types::AttributeValue;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    format_workout_message, send_discord_message, Config, HevyClient, Workout, WorkoutStore,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// SNS event envelope (only the fields we read).
#[derive(Debug, Deserialize)]
struct SnsEvent {
    #[serde(rename = "Records")]
    records: Vec<SnsRecord>,
}

#[derive(Debug, Deserialize)]
struct SnsRecord {
    #[serde(rename = "Sns")]
    sns: SnsMessage,
}

#[derive(Debug, Deserialize)]
struct SnsMessage {
    #[serde(rename = "Message")]
    message: String,
}

/// Command payload published by the Discord webhook Lambda.
#[derive(Debug, Deserialize)]
struct Command {
    command: String,
    date: Option<String>,
}

struct AppState {
    config: Config,
    s3_client: aws_sdk_s3::Client,
    dynamodb_client: aws_sdk_dynamodb::Client,
    ssm_client: aws_sdk_ssm::Client,
    store: WorkoutStore,
    hevy_client: HevyClient,
    http_client: reqwest::Client,
    discord_webhook: String,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let config = Config::from_env()?;
        let hevy_token =
            std::env::var("HEVY_TOKEN").map_err(|_| "HEVY_TOKEN not set")?;
        let discord_webhook =
            std::env::var("DISCORD_WEBHOOK").map_err(|_| "DISCORD_WEBHOOK not set")?;

        let s3_client = aws_sdk_s3::Client::new(&aws_config);
        let dynamodb_client = aws_sdk_dynamodb::Client::new(&aws_config);
        let store = WorkoutStore::new(
            s3_client.clone(),
            dynamodb_client.clone(),
            &config.bucket_name,
            &config.dynamodb_table,
        );

        Ok(Self {
            config,
            s3_client,
            dynamodb_client,
            ssm_client: aws_sdk_ssm::Client::new(&aws_config),
            store,
            hevy_client: HevyClient::new(hevy_token)?,
            http_client: reqwest::Client::new(),
            discord_webhook,
        })
    }

    async fn notify(&self, content: &str) {
        if let Err(e) =
            send_discord_message(&self.http_client, &self.discord_webhook, content).await
        {
            error!("Failed to send Discord message: {}", e);
        }
    }

    async fn read_watermark(&self) -> Result<i64, Error> {
        let response = self
            .ssm_client
            .get_parameter()
            .name(&self.config.watermark_parameter)
            .send()
            .await
            .map_err(|e| format!("Failed to read watermark: {}", e))?;

        let value = response
            .parameter()
            .and_then(|p| p.value())
            .ok_or("Watermark parameter has no value")?;

        Ok(value.parse()?)
    }

    async fn write_watermark(&self, index: i64) -> Result<(), Error> {
        self.ssm_client
            .put_parameter()
            .name(&self.config.watermark_parameter)
            .value(index.to_string())
            .r#type(aws_sdk_ssm::types::ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .map_err(|e| format!("Failed to update watermark: {}", e))?;
        Ok(())
    }

    /// Look up the stored S3 location of a workout by key attribute.
    async fn find_stored_workout(
        &self,
        attribute: &str,
        value: AttributeValue,
        index_name: Option<&str>,
    ) -> Result<(String, String), Error> {
        let mut query = self
            .dynamodb_client
            .query()
            .table_name(&self.config.dynamodb_table)
            .select(aws_sdk_dynamodb::types::Select::SpecificAttributes)
            .projection_expression("bucket_name, #key")
            .key_condition_expression(format!("#{} = :v1", attribute))
            .expression_attribute_names(format!("#{}", attribute), attribute)
            .expression_attribute_names("#key", "key")
            .expression_attribute_values(":v1", value);

        if let Some(index) = index_name {
            query = query.index_name(index);
        }

        let response = query
            .send()
            .await
            .map_err(|e| format!("DynamoDB query failed: {}", e))?;

        let item = response
            .items()
            .first()
            .ok_or("No matching workout found")?;

        let bucket = item
            .get("bucket_name")
            .and_then(|v| v.as_s().ok())
            .ok_or("Item missing bucket_name")?;
        let key = item
            .get("key")
            .and_then(|v| v.as_s().ok())
            .ok_or("Item missing key")?;

        Ok((bucket.clone(), key.clone()))
    }

    async fn load_workout_json(&self, bucket: &str, key: &str) -> Result<Workout, Error> {
        let response = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| format!("Failed to fetch s3://{}/{}: {}", bucket, key, e))?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| format!("Failed to read object body: {}", e))?
            .into_bytes();

        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Fetch every workout newer than the watermark, store it, and advance the
/// watermark to the last stored index.
async fn fetch_workouts(state: &AppState) -> Result<(), Error> {
    let watermark = state.read_watermark().await?;
    let workouts = state.hevy_client.fetch_since(watermark).await?;

    if workouts.is_empty() {
        info!("No workouts to fetch since the last update");
        state
            .notify("No workouts to fetch since the last update.")
            .await;
        return Ok(());
    }

    for workout in &workouts {
        state.store.store(workout).await?;
    }

    // The watermark only advances once everything fetched is stored
    if let Some(last) = workouts.last() {
        state.write_watermark(last.index).await?;
    }

    info!(count = workouts.len(), "Stored new workouts");
    state.notify("All missing workouts loaded.").await;
    Ok(())
}

async fn print_latest_workout(state: &AppState) -> Result<(), Error> {
    let watermark = state.read_watermark().await?;
    let (bucket, key) = state
        .find_stored_workout("index", AttributeValue::N(watermark.to_string()), None)
        .await?;
    let workout = state.load_workout_json(&bucket, &key).await?;
    state.notify(&format_workout_message(&workout)).await;
    Ok(())
}

async fn print_workout(state: &AppState, date: &str) -> Result<(), Error> {
    let (bucket, key) = state
        .find_stored_workout(
            "workout_day",
            AttributeValue::S(date.to_string()),
            Some(&state.config.workout_day_index),
        )
        .await?;
    let workout = state.load_workout_json(&bucket, &key).await?;
    state.notify(&format_workout_message(&workout)).await;
    Ok(())
}

async fn dispatch(state: &AppState, command: Command) {
    info!(command = %command.command, "Dispatching command");

    let outcome = match command.command.as_str() {
        "fetch_workouts" => fetch_workouts(state).await,
        "print_latest_workout" => print_latest_workout(state).await,
        "print_workout" => match command.date.as_deref() {
            Some(date) => print_workout(state, date).await,
            None => Err("print_workout requires a date".into()),
        },
        other => {
            warn!("Unknown command: {}", other);
            Ok(())
        }
    };

    if let Err(e) = outcome {
        error!("Command failed: {}", e);
        state
            .notify(&format!("Looks like something went wrong:\n\n{}", e))
            .await;
    }
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<SnsEvent>) -> Result<Value, Error> {
    let (payload, _context) = event.into_parts();

    for record in payload.records {
        match serde_json::from_str::<Command>(&record.sns.message) {
            Ok(command) => dispatch(&state, command).await,
            Err(e) => error!("Unparseable command message: {}", e),
        }
    }

    Ok(json!({"status": "ok"}))
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
    fn test_parse_sns_command() {
        let raw = r#"{
            "Records": [
                {"Sns": {"Message": "{\"command\": \"print_workout\", \"date\": \"2024-03-01\"}"}}
            ]
        }"#;
        let event: SnsEvent = serde_json::from_str(raw).unwrap();
        let command: Command = serde_json::from_str(&event.records[0].sns.message).unwrap();
        assert_eq!(command.command, "print_workout");
        assert_eq!(command.date.as_deref(), Some("2024-03-01"));
    }

    #[test]
    fn test_parse_command_without_date() {
        let command: Command = serde_json::from_str(r#"{"command": "fetch_workouts"}"#).unwrap();
        assert_eq!(command.command, "fetch_workouts");
        assert!(command.date.is_none());
    }
}
