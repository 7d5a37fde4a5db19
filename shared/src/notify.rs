//! Discord webhook notifications.

use serde_json::json;
use tracing::error;

use crate::models::Workout;
use crate::Result;

/// Push a plain-text message to a Discord webhook.
pub async fn send_discord_message(
    client: &reqwest::Client,
    webhook_url: &str,
    content: &str,
) -> Result<()> {
    let response = client
        .post(webhook_url)
        .json(&json!({ "content": content }))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("Discord webhook failed: {} - {}", status, body);
    }
    Ok(())
}

/// Format a workout into a human-readable Discord message.
pub fn format_workout_message(workout: &Workout) -> String {
    let mut message = String::new();
    for exercise in &workout.exercises {
        message.push_str(&format!("{}\n", exercise.title));
        message.push_str(&format!("Notes: {}\n", exercise.notes));
        for set in &exercise.sets {
            message.push_str(&format!(
                "Weight: {} kg, reps: {}\n",
                set.weight_kg.unwrap_or_default(),
                set.reps.unwrap_or_default()
            ));
        }
        message.push_str("------------------\n");
    }
    message.push_str(&format!("https://hevy.com/workout/{}\n", workout.id));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exercise, WorkoutSet};

    #[test]
    fn test_format_workout_message() {
        let workout = Workout {
            id: "abc123".to_string(),
            index: 0,
            name: "Push".to_string(),
            nth_workout: 1,
            start_time: 1700000000,
            exercises: vec![Exercise {
                title: "Bench Press (Barbell)".to_string(),
                notes: "felt heavy".to_string(),
                sets: vec![WorkoutSet {
                    weight_kg: Some(80.0),
                    reps: Some(8),
                }],
            }],
        };

        let message = format_workout_message(&workout);
        assert!(message.contains("Bench Press (Barbell)"));
        assert!(message.contains("Notes: felt heavy"));
        assert!(message.contains("Weight: 80 kg, reps: 8"));
        assert!(message.ends_with("https://hevy.com/workout/abc123\n"));
    }
}
