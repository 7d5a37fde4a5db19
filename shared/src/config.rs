//! Configuration management for Lambda functions.

use std::env;

use crate::{Error, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// S3 bucket holding raw workout JSON and the LanceDB dataset
    pub bucket_name: String,
    /// DynamoDB table registering stored workout files
    pub dynamodb_table: String,
    /// Name of the DynamoDB GSI keyed by workout day
    pub workout_day_index: String,
    /// SSM parameter holding the latest fetched workout index
    pub watermark_parameter: String,
    /// AWS region
    pub aws_region: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bucket_name: require("BUCKET_NAME")?,
            dynamodb_table: require("DYNAMODB_TABLE_NAME")?,
            workout_day_index: env::var("WORKOUT_DAY_INDEX")
                .unwrap_or_else(|_| "workout-day-index".to_string()),
            watermark_parameter: env::var("WATERMARK_PARAMETER")
                .unwrap_or_else(|_| "/silka/latest-workout-index".to_string()),
            aws_region: env::var("AWS_REGION").unwrap_or_else(|_| "eu-central-1".to_string()),
        })
    }

    /// LanceDB dataset URI inside the configured bucket.
    pub fn lancedb_uri(&self) -> String {
        format!("s3://{}/lancedb", self.bucket_name)
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{} not set", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-wide, so everything lives in one test.
    #[test]
    fn test_from_env_defaults_and_missing_vars() {
        env::remove_var("BUCKET_NAME");
        env::remove_var("DYNAMODB_TABLE_NAME");
        let missing = Config::from_env();
        assert!(matches!(missing, Err(Error::Config(ref m)) if m.contains("BUCKET_NAME")));

        env::set_var("BUCKET_NAME", "silka-data");
        env::set_var("DYNAMODB_TABLE_NAME", "workouts");
        env::remove_var("WORKOUT_DAY_INDEX");
        env::remove_var("WATERMARK_PARAMETER");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bucket_name, "silka-data");
        assert_eq!(config.workout_day_index, "workout-day-index");
        assert_eq!(config.watermark_parameter, "/silka/latest-workout-index");
        assert_eq!(config.lancedb_uri(), "s3://silka-data/lancedb");
    }
}
