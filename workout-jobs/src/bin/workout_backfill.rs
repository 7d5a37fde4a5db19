//! Workout Backfill Lambda - full refetch of the workout history.
//!
//! Pages through every Hevy batch, uploads and registers all workouts, then
//! recomputes the watermark from the highest stored index.

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Serialize;
use serde_json::Value;
use shared::{Config, HevyClient, WorkoutStore};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct BackfillResponse {
    workouts_stored: u32,
    errors: u32,
    watermark: i64,
}

struct AppState {
    config: Config,
    dynamodb_client: aws_sdk_dynamodb::Client,
    ssm_client: aws_sdk_ssm::Client,
    store: WorkoutStore,
    hevy_client: HevyClient,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let config = Config::from_env()?;
        let hevy_token = std::env::var("HEVY_TOKEN").map_err(|_| "HEVY_TOKEN not set")?;

        let dynamodb_client = aws_sdk_dynamodb::Client::new(&aws_config);
        let store = WorkoutStore::new(
            aws_sdk_s3::Client::new(&aws_config),
            dynamodb_client.clone(),
            &config.bucket_name,
            &config.dynamodb_table,
        );

        Ok(Self {
            config,
            dynamodb_client,
            ssm_client: aws_sdk_ssm::Client::new(&aws_config),
            store,
            hevy_client: HevyClient::new(hevy_token)?,
        })
    }

    /// Highest workout index present in the registry table.
    async fn max_stored_index(&self) -> Result<i64, Error> {
        let mut max_index: i64 = -1;
        let mut exclusive_start_key = None;

        loop {
            let response = self
                .dynamodb_client
                .scan()
                .table_name(&self.config.dynamodb_table)
                .projection_expression("#index")
                .expression_attribute_names("#index", "index")
                .set_exclusive_start_key(exclusive_start_key)
                .send()
                .await
                .map_err(|e| format!("DynamoDB scan failed: {}", e))?;

            for item in response.items() {
                if let Some(index) = item
                    .get("index")
                    .and_then(|v| v.as_n().ok())
                    .and_then(|n| n.parse::<i64>().ok())
                {
                    max_index = max_index.max(index);
                }
            }

            exclusive_start_key = response.last_evaluated_key().map(|k| k.clone());
            if exclusive_start_key.is_none() {
                break;
            }
        }

        Ok(max_index)
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
}

async fn handler(state: Arc<AppState>, _event: LambdaEvent<Value>) -> Result<BackfillResponse, Error> {
    let total = state.hevy_client.workout_count().await?;
    info!(total, "Starting full backfill");

    let workouts = state.hevy_client.fetch_all().await?;

    let mut stored: u32 = 0;
    let mut errors: u32 = 0;
    for workout in &workouts {
        match state.store.store(workout).await {
            Ok(()) => stored += 1,
            Err(e) => {
                error!("Failed to store workout {}: {}", workout.id, e);
                errors += 1;
            }
        }
    }

    let watermark = state.max_stored_index().await?;
    state.write_watermark(watermark).await?;

    info!(stored, errors, watermark, "Backfill complete");
    Ok(BackfillResponse {
        workouts_stored: stored,
        errors,
        watermark,
    })
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
