//! Discord Webhook Lambda - Handles Discord bot interactions.
//!
//! Verifies interaction signatures, answers PINGs, and dispatches slash
//! commands: pipeline commands are published to SNS for the workout-sync
//! Lambda, free-text questions go to the agent Lambda via a deferred
//! response and an async self-invocation (Discord's 3-second timeout).

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::LambdaInvoker;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Discord interaction types
const INTERACTION_PING: u8 = 1;
const INTERACTION_APPLICATION_COMMAND: u8 = 2;

/// Discord response types
const RESPONSE_PONG: u8 = 1;
const RESPONSE_CHANNEL_MESSAGE: u8 = 4;
const RESPONSE_DEFERRED_CHANNEL_MESSAGE: u8 = 5;

/// Commands forwarded to the workout-sync Lambda over SNS.
const PIPELINE_COMMANDS: [&str; 3] = ["fetch_workouts", "print_latest_workout", "print_workout"];

/// Discord interaction request
#[derive(Debug, Deserialize, Clone)]
struct DiscordInteraction {
    #[serde(rename = "type")]
    interaction_type: u8,
    token: Option<String>,
    data: Option<InteractionData>,
    member: Option<GuildMember>,
    user: Option<DiscordUser>,
    application_id: Option<String>,
}

/// Discord interaction data (for slash commands)
#[derive(Debug, Deserialize, Clone)]
struct InteractionData {
    name: String,
    options: Option<Vec<CommandOption>>,
}

/// Discord command option
#[derive(Debug, Deserialize, Clone)]
struct CommandOption {
    name: String,
    value: serde_json::Value,
}

/// Discord guild member
#[derive(Debug, Deserialize, Clone)]
struct GuildMember {
    user: DiscordUser,
}

/// Discord user
#[derive(Debug, Deserialize, Clone)]
struct DiscordUser {
    id: String,
    username: String,
}

/// Discord interaction response
#[derive(Debug, Serialize)]
struct DiscordResponse {
    #[serde(rename = "type")]
    response_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<ResponseData>,
}

/// Discord response data
#[derive(Debug, Serialize)]
struct ResponseData {
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flags: Option<u32>,
}

/// Payload for async follow-up processing of `ask`
#[derive(Debug, Serialize, Deserialize)]
struct FollowUpPayload {
    follow_up: bool,
    application_id: String,
    interaction_token: String,
    question: String,
    user_id: String,
    username: String,
}

/// API Gateway proxy request (simplified)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiGatewayRequest {
    headers: Option<std::collections::HashMap<String, String>>,
    body: Option<String>,
}

/// API Gateway proxy response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGatewayResponse {
    status_code: u16,
    headers: std::collections::HashMap<String, String>,
    body: String,
    is_base64_encoded: bool,
}

impl ApiGatewayResponse {
    fn new(status_code: u16, body: &str, content_type: &str) -> Self {
        let mut headers = std::collections::HashMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        Self {
            status_code,
            headers,
            body: body.to_string(),
            is_base64_encoded: false,
        }
    }

    fn json<T: Serialize>(status_code: u16, data: &T) -> Result<Self, Error> {
        let body = serde_json::to_string(data)?;
        Ok(Self::new(status_code, &body, "application/json"))
    }
}

fn ephemeral_message(content: &str) -> DiscordResponse {
    DiscordResponse {
        response_type: RESPONSE_CHANNEL_MESSAGE,
        data: Some(ResponseData {
            content: content.to_string(),
            flags: Some(64),
        }),
    }
}

/// Application state
struct AppState {
    invoker: LambdaInvoker,
    sns_client: aws_sdk_sns::Client,
    http_client: reqwest::Client,
    discord_public_key: VerifyingKey,
    sns_topic_arn: String,
    agent_function: String,
    function_name: String,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let sns_topic_arn =
            std::env::var("SNS_TOPIC_ARN").map_err(|_| "SNS_TOPIC_ARN not set")?;

        let agent_function =
            std::env::var("AGENT_FUNCTION_NAME").unwrap_or_else(|_| "silka-agent".to_string());

        let function_name = std::env::var("AWS_LAMBDA_FUNCTION_NAME")
            .unwrap_or_else(|_| "silka-discord-webhook".to_string());

        let public_key_hex = std::env::var("DISCORD_PUBLIC_KEY")
            .map_err(|_| "DISCORD_PUBLIC_KEY not set")?;

        let public_key_bytes = hex::decode(&public_key_hex)
            .map_err(|e| format!("Invalid public key hex: {}", e))?;

        let public_key: [u8; 32] = public_key_bytes
            .try_into()
            .map_err(|_| "Public key must be 32 bytes")?;

        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| format!("Invalid public key: {}", e))?;

        Ok(Self {
            invoker: LambdaInvoker::new(aws_sdk_lambda::Client::new(&config)),
            sns_client: aws_sdk_sns::Client::new(&config),
            http_client: reqwest::Client::new(),
            discord_public_key: verifying_key,
            sns_topic_arn,
            agent_function,
            function_name,
        })
    }

    /// Publish a pipeline command for the workout-sync Lambda.
    async fn publish_command(&self, command: &str, date: Option<&str>) -> Result<(), Error> {
        let mut message = serde_json::json!({ "command": command });
        if let Some(date) = date {
            message["date"] = Value::String(date.to_string());
        }

        self.sns_client
            .publish()
            .topic_arn(&self.sns_topic_arn)
            .message(serde_json::to_string(&message)?)
            .send()
            .await
            .map_err(|e| format!("Failed to publish command: {}", e))?;

        info!(command, "Published command to SNS");
        Ok(())
    }

    /// Edit the original interaction message with the final answer.
    async fn send_follow_up(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
    ) -> Result<(), Error> {
        let url = format!(
            "https://discord.com/api/v10/webhooks/{}/{}/messages/@original",
            application_id, interaction_token
        );

        let payload = serde_json::json!({
            "content": content
        });

        let response = self
            .http_client
            .patch(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("Failed to send follow-up: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Discord webhook failed: {} - {}", status, body);
            return Err(format!("Discord webhook failed: {}", status).into());
        }

        info!("Follow-up message sent successfully");
        Ok(())
    }

    /// Invoke self asynchronously for follow-up processing
    async fn invoke_follow_up(&self, payload: &FollowUpPayload) -> Result<(), Error> {
        self.invoker
            .invoke_async(&self.function_name, &serde_json::to_value(payload)?)
            .await?;
        info!("Follow-up invocation triggered");
        Ok(())
    }
}

/// Verify Discord signature
fn verify_signature(
    public_key: &VerifyingKey,
    signature_hex: &str,
    timestamp: &str,
    body: &str,
) -> bool {
    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let signature: [u8; 64] = match signature_bytes.try_into() {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(&signature);

    let message = format!("{}{}", timestamp, body);
    public_key.verify(message.as_bytes(), &signature).is_ok()
}

/// Pull a named string option out of the command options.
fn option_value(data: &InteractionData, names: &[&str]) -> Option<String> {
    data.options.as_ref().and_then(|opts| {
        opts.iter()
            .find(|o| names.contains(&o.name.as_str()))
            .and_then(|o| o.value.as_str().map(String::from))
    })
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<Value>) -> Result<Value, Error> {
    let (payload, _context) = event.into_parts();

    // Check if this is a direct follow-up invocation (not from API Gateway)
    if let Ok(follow_up) = serde_json::from_value::<FollowUpPayload>(payload.clone()) {
        if follow_up.follow_up {
            info!(
                "Processing follow-up question from user {}",
                follow_up.username
            );
            return handle_follow_up(state, follow_up).await;
        }
    }

    // This is an API Gateway request
    let api_request: ApiGatewayRequest = serde_json::from_value(payload)?;

    let body_str = api_request.body.unwrap_or_default();

    // Get signature headers (case-insensitive)
    let headers = api_request.headers.unwrap_or_default();
    let signature = headers
        .iter()
        .find(|(k, _)| k.to_lowercase() == "x-signature-ed25519")
        .map(|(_, v)| v.as_str())
        .unwrap_or("");
    let timestamp = headers
        .iter()
        .find(|(k, _)| k.to_lowercase() == "x-signature-timestamp")
        .map(|(_, v)| v.as_str())
        .unwrap_or("");

    if !verify_signature(&state.discord_public_key, signature, timestamp, &body_str) {
        warn!("Invalid Discord signature");
        return Ok(serde_json::to_value(ApiGatewayResponse::new(
            401,
            "Invalid signature",
            "text/plain",
        ))?);
    }

    let interaction: DiscordInteraction = match serde_json::from_str(&body_str) {
        Ok(i) => i,
        Err(e) => {
            error!("Failed to parse interaction: {}", e);
            return Ok(serde_json::to_value(ApiGatewayResponse::new(
                400,
                "Invalid request",
                "text/plain",
            ))?);
        }
    };

    // Handle ping (verification)
    if interaction.interaction_type == INTERACTION_PING {
        info!("Responding to Discord PING");
        return Ok(serde_json::to_value(ApiGatewayResponse::json(
            200,
            &DiscordResponse {
                response_type: RESPONSE_PONG,
                data: None,
            },
        )?)?);
    }

    if interaction.interaction_type == INTERACTION_APPLICATION_COMMAND {
        let data = match &interaction.data {
            Some(d) => d,
            None => {
                return Ok(serde_json::to_value(ApiGatewayResponse::json(
                    200,
                    &ephemeral_message("Invalid command"),
                )?)?);
            }
        };

        let user = interaction
            .member
            .as_ref()
            .map(|m| &m.user)
            .or(interaction.user.as_ref())
            .cloned()
            .unwrap_or(DiscordUser {
                id: "unknown".to_string(),
                username: "unknown".to_string(),
            });

        info!(
            "Processing command '{}' from user {}",
            data.name, user.username
        );

        // Pipeline commands go to SNS; the reply arrives via the outbound webhook
        if PIPELINE_COMMANDS.contains(&data.name.as_str()) {
            let date = option_value(data, &["date"]);
            if data.name == "print_workout" && date.is_none() {
                return Ok(serde_json::to_value(ApiGatewayResponse::json(
                    200,
                    &ephemeral_message("The print_workout command needs a date."),
                )?)?);
            }

            if let Err(e) = state.publish_command(&data.name, date.as_deref()).await {
                error!("Failed to publish command: {}", e);
                return Ok(serde_json::to_value(ApiGatewayResponse::json(
                    200,
                    &ephemeral_message("Sorry, something went wrong. Please try again."),
                )?)?);
            }

            return Ok(serde_json::to_value(ApiGatewayResponse::json(
                200,
                &DiscordResponse {
                    response_type: RESPONSE_CHANNEL_MESSAGE,
                    data: Some(ResponseData {
                        content: "Command accepted. The webhook will come to you with the response."
                            .to_string(),
                        flags: None,
                    }),
                },
            )?)?);
        }

        if data.name == "ask" {
            let question = option_value(data, &["question", "message"]).unwrap_or_default();

            let application_id = interaction
                .application_id
                .clone()
                .unwrap_or_else(|| std::env::var("DISCORD_APPLICATION_ID").unwrap_or_default());
            let interaction_token = interaction.token.clone().unwrap_or_default();

            if application_id.is_empty() || interaction_token.is_empty() {
                error!("Missing application_id or interaction_token");
                return Ok(serde_json::to_value(ApiGatewayResponse::json(
                    200,
                    &ephemeral_message("Configuration error. Please try again later."),
                )?)?);
            }

            let follow_up_payload = FollowUpPayload {
                follow_up: true,
                application_id,
                interaction_token,
                question,
                user_id: user.id,
                username: user.username,
            };

            if let Err(e) = state.invoke_follow_up(&follow_up_payload).await {
                error!("Failed to invoke follow-up: {}", e);
                return Ok(serde_json::to_value(ApiGatewayResponse::json(
                    200,
                    &ephemeral_message("Sorry, something went wrong. Please try again."),
                )?)?);
            }

            // Return deferred response immediately
            return Ok(serde_json::to_value(ApiGatewayResponse::json(
                200,
                &DiscordResponse {
                    response_type: RESPONSE_DEFERRED_CHANNEL_MESSAGE,
                    data: None,
                },
            )?)?);
        }

        return Ok(serde_json::to_value(ApiGatewayResponse::json(
            200,
            &ephemeral_message(&format!("Unknown command: {}", data.name)),
        )?)?);
    }

    // Unknown interaction type
    Ok(serde_json::to_value(ApiGatewayResponse::new(
        400,
        "Unknown interaction type",
        "text/plain",
    ))?)
}

/// Handle follow-up processing (async invocation): ask the agent, then edit
/// the deferred message.
async fn handle_follow_up(state: Arc<AppState>, payload: FollowUpPayload) -> Result<Value, Error> {
    let response_text = match state
        .invoker
        .invoke(
            &state.agent_function,
            &serde_json::json!({ "prompt": payload.question }),
        )
        .await
    {
        Ok(response) => response
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or("Sorry, I couldn't process that question.")
            .to_string(),
        Err(e) => {
            error!("Agent error: {}", e);
            "Sorry, I couldn't process that question. Please try again.".to_string()
        }
    };

    if let Err(e) = state
        .send_follow_up(
            &payload.application_id,
            &payload.interaction_token,
            &response_text,
        )
        .await
    {
        error!("Failed to send follow-up message: {}", e);
    }

    Ok(serde_json::json!({"status": "ok"}))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let state = Arc::new(AppState::new().await?);

    lambda_runtime::run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_parse_interaction_with_options() {
        let raw = r#"{
            "type": 2,
            "token": "tok",
            "application_id": "app",
            "data": {
                "name": "print_workout",
                "options": [{"name": "date", "value": "2024-03-01"}]
            },
            "member": {"user": {"id": "1", "username": "lifter"}}
        }"#;
        let interaction: DiscordInteraction = serde_json::from_str(raw).unwrap();
        assert_eq!(interaction.interaction_type, INTERACTION_APPLICATION_COMMAND);
        let data = interaction.data.unwrap();
        assert_eq!(option_value(&data, &["date"]).as_deref(), Some("2024-03-01"));
        assert!(option_value(&data, &["question"]).is_none());
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let verifying_key = signing_key.verifying_key();

        let timestamp = "1700000000";
        let body = r#"{"type": 1}"#;
        let signature = signing_key.sign(format!("{}{}", timestamp, body).as_bytes());
        let signature_hex = hex::encode(signature.to_bytes());

        assert!(verify_signature(&verifying_key, &signature_hex, timestamp, body));
        assert!(!verify_signature(&verifying_key, &signature_hex, "1700000001", body));
        assert!(!verify_signature(&verifying_key, "zz", timestamp, body));
    }

    #[test]
    fn test_follow_up_payload_round_trip() {
        let payload = FollowUpPayload {
            follow_up: true,
            application_id: "app".to_string(),
            interaction_token: "tok".to_string(),
            question: "total reps?".to_string(),
            user_id: "1".to_string(),
            username: "lifter".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let parsed: FollowUpPayload = serde_json::from_value(value).unwrap();
        assert!(parsed.follow_up);
        assert_eq!(parsed.question, "total reps?");
    }
}
