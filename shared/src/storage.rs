//! Workout storage: raw JSON in S3, registry items in DynamoDB.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use tracing::debug;

use crate::models::Workout;
use crate::{Error, Result};

/// Writes workouts to S3 and registers each stored file in DynamoDB.
#[derive(Clone)]
pub struct WorkoutStore {
    s3_client: aws_sdk_s3::Client,
    dynamodb_client: aws_sdk_dynamodb::Client,
    bucket_name: String,
    table_name: String,
}

impl WorkoutStore {
    pub fn new(
        s3_client: aws_sdk_s3::Client,
        dynamodb_client: aws_sdk_dynamodb::Client,
        bucket_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            s3_client,
            dynamodb_client,
            bucket_name: bucket_name.into(),
            table_name: table_name.into(),
        }
    }

    /// Upload the raw workout JSON to S3 and register it in DynamoDB.
    pub async fn store(&self, workout: &Workout) -> Result<()> {
        let key = workout.s3_key();
        let body = serde_json::to_vec(workout)?;

        self.s3_client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .body(body.into())
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to upload workout {}: {}", workout.id, e)))?;

        self.dynamodb_client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(workout_item(workout, &self.bucket_name, key)))
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to register workout {}: {}", workout.id, e)))?;

        debug!(id = %workout.id, index = workout.index, "Stored workout");
        Ok(())
    }
}

/// DynamoDB registry item for a stored workout file. Numeric attributes use
/// the N type so the index can be queried numerically.
fn workout_item(workout: &Workout, bucket_name: &str, key: String) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (
            "index".to_string(),
            AttributeValue::N(workout.index.to_string()),
        ),
        ("name".to_string(), AttributeValue::S(workout.name.clone())),
        ("id".to_string(), AttributeValue::S(workout.id.clone())),
        (
            "nth_workout".to_string(),
            AttributeValue::N(workout.nth_workout.to_string()),
        ),
        (
            "start_time".to_string(),
            AttributeValue::N(workout.start_time.to_string()),
        ),
        (
            "bucket_name".to_string(),
            AttributeValue::S(bucket_name.to_string()),
        ),
        ("key".to_string(), AttributeValue::S(key)),
        (
            "workout_day".to_string(),
            AttributeValue::S(workout.workout_day()),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workout_item_attribute_types() {
        let workout: Workout = serde_json::from_str(
            r#"{"id": "abc123", "index": 42, "name": "Push Day", "nth_workout": 7,
                "start_time": 1700000000, "exercises": []}"#,
        )
        .unwrap();

        let item = workout_item(&workout, "silka-data", workout.s3_key());

        assert_eq!(item["index"], AttributeValue::N("42".to_string()));
        assert_eq!(item["nth_workout"], AttributeValue::N("7".to_string()));
        assert_eq!(item["start_time"], AttributeValue::N("1700000000".to_string()));
        assert_eq!(item["bucket_name"], AttributeValue::S("silka-data".to_string()));
        assert_eq!(item["workout_day"], AttributeValue::S("2023-11-14".to_string()));
        assert_eq!(
            item["key"],
            AttributeValue::S("sorted_workouts/2023/11/14/abc123.json".to_string())
        );
    }
}
