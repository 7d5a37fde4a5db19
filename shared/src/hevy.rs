//! Client for the Hevy workout-tracking API.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::Deserialize;
use tracing::info;

use crate::models::Workout;
use crate::{Error, Result};

const BASE_URL: &str = "https://api.hevyapp.com";

/// The batch endpoint returns at most this many workouts per page.
pub const PAGE_SIZE: usize = 10;

#[derive(Debug, Deserialize)]
struct WorkoutCountResponse {
    workout_count: u64,
}

/// Authenticated client for the Hevy batch API.
#[derive(Clone)]
pub struct HevyClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HevyClient {
    pub fn new(auth_token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(auth_token, BASE_URL)
    }

    pub fn with_base_url(auth_token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert("x-api-key", HeaderValue::from_static("klean_kanteen_insulated"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token: auth_token.into(),
        })
    }

    /// Total number of workouts in the account.
    pub async fn workout_count(&self) -> Result<u64> {
        let response: WorkoutCountResponse = self
            .client
            .get(format!("{}/workout_count", self.base_url))
            .header("auth-token", &self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.workout_count)
    }

    /// One page of workouts starting at the given index (ascending).
    pub async fn workouts_batch(&self, start_index: i64) -> Result<Vec<Workout>> {
        let workouts: Vec<Workout> = self
            .client
            .get(format!("{}/workouts_batch/{}", self.base_url, start_index))
            .header("auth-token", &self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(workouts)
    }

    /// Every workout with an index greater than the watermark, paging until
    /// a short batch signals the end.
    pub async fn fetch_since(&self, watermark: i64) -> Result<Vec<Workout>> {
        let mut all = Vec::new();
        let mut next_index = watermark + 1;

        loop {
            let page = self.workouts_batch(next_index).await?;
            let page_len = page.len();
            if let Some(last) = page.last() {
                next_index = last.index + 1;
            }
            all.extend(page);
            if page_len < PAGE_SIZE {
                break;
            }
        }

        info!(count = all.len(), watermark, "Fetched workouts from Hevy");
        Ok(all)
    }

    /// Full backfill: every workout from index zero.
    pub async fn fetch_all(&self) -> Result<Vec<Workout>> {
        self.fetch_since(-1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP stub: serves a canned JSON body per request path,
    /// `[]` for anything unrouted.
    async fn spawn_stub(routes: HashMap<String, String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let body = routes.get(&path).cloned().unwrap_or_else(|| "[]".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{}", addr)
    }

    fn page_json(start_index: i64, count: usize) -> String {
        let workouts: Vec<_> = (0..count as i64)
            .map(|offset| {
                let index = start_index + offset;
                json!({
                    "id": format!("w{}", index),
                    "index": index,
                    "name": "Push",
                    "nth_workout": index + 1,
                    "start_time": 1700000000 + index * 86400,
                    "exercises": []
                })
            })
            .collect();
        serde_json::to_string(&workouts).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_since_pages_until_short_batch() {
        let routes = HashMap::from([
            ("/workouts_batch/0".to_string(), page_json(0, PAGE_SIZE)),
            ("/workouts_batch/10".to_string(), page_json(10, 3)),
        ]);
        let base_url = spawn_stub(routes).await;

        let client = HevyClient::with_base_url("token", base_url).unwrap();
        let workouts = client.fetch_since(-1).await.unwrap();

        assert_eq!(workouts.len(), 13);
        assert_eq!(workouts.first().unwrap().index, 0);
        assert_eq!(workouts.last().unwrap().index, 12);
    }

    #[tokio::test]
    async fn test_fetch_since_stops_on_empty_first_page() {
        let base_url = spawn_stub(HashMap::new()).await;

        let client = HevyClient::with_base_url("token", base_url).unwrap();
        let workouts = client.fetch_since(5).await.unwrap();

        assert!(workouts.is_empty());
    }

    #[test]
    fn test_parse_workout_count() {
        let parsed: WorkoutCountResponse =
            serde_json::from_str(r#"{"workout_count": 321}"#).unwrap();
        assert_eq!(parsed.workout_count, 321);
    }

    #[test]
    fn test_parse_workout_batch() {
        let json = r#"[
            {"id": "a", "index": 0, "name": "Push", "nth_workout": 1, "start_time": 1700000000, "exercises": []},
            {"id": "b", "index": 1, "name": "Pull", "nth_workout": 2, "start_time": 1700090000, "exercises": []}
        ]"#;
        let batch: Vec<Workout> = serde_json::from_str(json).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].index, 1);
    }
}
