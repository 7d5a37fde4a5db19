//! Lambda-to-Lambda invocation client.

use aws_sdk_lambda::primitives::Blob;
use serde_json::{json, Value};

use crate::{Error, Result};

/// Client for invoking sibling Lambda functions.
#[derive(Clone)]
pub struct LambdaInvoker {
    client: aws_sdk_lambda::Client,
}

impl LambdaInvoker {
    pub fn new(client: aws_sdk_lambda::Client) -> Self {
        Self { client }
    }

    /// Synchronous request/response invocation; the response payload is
    /// parsed as JSON.
    pub async fn invoke(&self, function_name: &str, payload: &Value) -> Result<Value> {
        let payload_bytes = serde_json::to_vec(payload)?;

        let response = self
            .client
            .invoke()
            .function_name(function_name)
            .payload(Blob::new(payload_bytes))
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to invoke {}: {}", function_name, e)))?;

        let response_payload = response
            .payload()
            .ok_or_else(|| Error::Aws(format!("No response payload from {}", function_name)))?;

        serde_json::from_slice(response_payload.as_ref()).map_err(Error::Serialization)
    }

    /// Fire-and-forget invocation (`Event` type), used for deferred
    /// follow-up processing.
    pub async fn invoke_async(&self, function_name: &str, payload: &Value) -> Result<()> {
        let payload_bytes = serde_json::to_vec(payload)?;

        self.client
            .invoke()
            .function_name(function_name)
            .invocation_type(aws_sdk_lambda::types::InvocationType::Event)
            .payload(Blob::new(payload_bytes))
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to invoke {}: {}", function_name, e)))?;

        Ok(())
    }

    /// Invoke the table-schema function for the given prompt.
    pub async fn get_table_schema(&self, function_name: &str, prompt: &str) -> Result<Value> {
        self.invoke(function_name, &json!({ "prompt": prompt })).await
    }

    /// Invoke the query-executor function with a SQL query and the prompt
    /// that produced it.
    pub async fn execute_query(
        &self,
        function_name: &str,
        query: &str,
        user_prompt: &str,
    ) -> Result<Value> {
        self.invoke(
            function_name,
            &json!({ "query": query, "user_prompt": user_prompt }),
        )
        .await
    }
}
