//! Text embeddings via the Bedrock Titan embedding model.

use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::Client as BedrockClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Default Titan embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v2:0";

/// Dimension of the Titan v2 embedding vectors.
pub const EMBEDDING_DIM: usize = 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TitanRequest<'a> {
    input_text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TitanResponse {
    embedding: Vec<f32>,
}

/// Client producing fixed-length embedding vectors from text.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: BedrockClient,
    model_id: String,
}

impl EmbeddingClient {
    pub fn new(client: BedrockClient) -> Self {
        Self {
            client,
            model_id: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }

    pub fn with_model(client: BedrockClient, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }

    /// Embed a text into a fixed-length vector.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::to_vec(&TitanRequest { input_text: text })?;

        let invocation = self
            .client
            .invoke_model()
            .model_id(&self.model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to invoke embedding model: {}", e)))?;

        let response: TitanResponse = serde_json::from_slice(invocation.body().as_ref())?;

        debug!(
            model = %self.model_id,
            dims = response.embedding.len(),
            "Embedded text"
        );

        Ok(response.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_titan_request_shape() {
        let body = serde_json::to_value(TitanRequest {
            input_text: "how many reps",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"inputText": "how many reps"}));
    }

    #[test]
    fn test_titan_response_parse() {
        let raw = r#"{"embedding": [0.1, -0.2, 0.3], "inputTextTokenCount": 4}"#;
        let parsed: TitanResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.embedding.len(), 3);
    }
}
