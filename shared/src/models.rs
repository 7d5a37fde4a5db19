//! Shared data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A workout as returned by the Hevy batch API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workout {
    pub id: String,
    pub index: i64,
    pub name: String,
    pub nth_workout: i64,
    /// Unix timestamp (seconds) of the workout start
    pub start_time: i64,
    #[serde(default)]
    pub exercises: Vec<Exercise>,
}

/// One exercise inside a workout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub sets: Vec<WorkoutSet>,
}

/// One set inside an exercise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkoutSet {
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub reps: Option<i64>,
}

impl Workout {
    /// Start of the workout as a UTC datetime.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.start_time, 0)
    }

    /// Calendar day of the workout, `YYYY-MM-DD`.
    pub fn workout_day(&self) -> String {
        self.started_at()
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }

    /// Date-partitioned S3 key for the raw workout JSON.
    pub fn s3_key(&self) -> String {
        let day = self
            .started_at()
            .map(|dt| dt.format("%Y/%m/%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("sorted_workouts/{}/{}.json", day, self.id)
    }
}

/// A stored record of a successfully executed analytical query.
///
/// Upserted into the LanceDB table on every successful Athena query and
/// retrieved by vector distance as a few-shot exemplar for new prompts.
/// The embedding itself stays in the store; it is not read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHistoryRecord {
    pub user_prompt: String,
    pub query_id: String,
    pub sql_query: String,
    pub tables_used: Vec<String>,
    pub columns_used: Vec<String>,
    pub query_type: Vec<String>,
    pub returned_rows: i64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hevy_workout() {
        let json = r#"{
            "id": "abc123",
            "index": 42,
            "name": "Push Day",
            "nth_workout": 120,
            "start_time": 1700000000,
            "exercises": [
                {
                    "title": "Bench Press (Barbell)",
                    "notes": "",
                    "sets": [
                        {"weight_kg": 80.0, "reps": 8},
                        {"weight_kg": null, "reps": 12}
                    ]
                }
            ]
        }"#;
        let workout: Workout = serde_json::from_str(json).unwrap();
        assert_eq!(workout.id, "abc123");
        assert_eq!(workout.exercises[0].sets.len(), 2);
        assert_eq!(workout.exercises[0].sets[1].weight_kg, None);
    }

    #[test]
    fn test_s3_key_is_date_partitioned() {
        let workout = Workout {
            id: "abc123".to_string(),
            index: 1,
            name: "Legs".to_string(),
            nth_workout: 1,
            start_time: 1700000000, // 2023-11-14 UTC
            exercises: vec![],
        };
        assert_eq!(workout.s3_key(), "sorted_workouts/2023/11/14/abc123.json");
        assert_eq!(workout.workout_day(), "2023-11-14");
    }
}
