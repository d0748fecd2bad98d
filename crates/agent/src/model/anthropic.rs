//! Anthropic Messages API client.

use super::http::HttpClient;
use super::{ModelClient, ModelRequest, ModelResponse, StopReason};
use crate::config::ModelConfig;
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use switchyard_core::conversation::{ContentBlock, Role, Turn};
use tracing::debug;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: HttpClient,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> AgentResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Config("Anthropic API key is not set".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HttpClient::header_value(&api_key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            http: HttpClient::new(Arc::new(config), headers)?,
        })
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.http.config().model
    }

    async fn complete(&self, request: ModelRequest) -> AgentResult<ModelResponse> {
        let body = request_body(self.model(), &request);
        let response: MessagesResponse = self.http.post("messages", &body).await?;
        response.into_model_response()
    }
}

pub(crate) fn request_body(model: &str, request: &ModelRequest) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": request.messages.iter().map(message).collect::<Vec<_>>(),
    });

    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(|t| t.to_anthropic()).collect();
        body["tool_choice"] = json!({"type": "auto"});
    }
    body
}

fn message(turn: &Turn) -> Value {
    let role = match turn.role {
        Role::Assistant => "assistant",
        // tool results travel in a user message
        Role::User | Role::Tool => "user",
    };
    json!({
        "role": role,
        "content": turn.content.iter().map(block).collect::<Vec<_>>(),
    })
}

fn block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default = "empty_input")]
        input: Value,
    },
    /// Thinking and other blocks the loop does not use
    #[serde(other)]
    Unknown,
}

fn empty_input() -> Value {
    json!({})
}

impl MessagesResponse {
    fn into_model_response(self) -> AgentResult<ModelResponse> {
        let mut content = Vec::with_capacity(self.content.len());
        for block in self.content {
            match block {
                ResponseBlock::Text { text } => content.push(ContentBlock::text(text)),
                ResponseBlock::ToolUse { id, name, input } => {
                    if id.is_empty() || name.is_empty() {
                        return Err(AgentError::InvalidResponse(
                            "tool_use block without id or name".to_string(),
                        ));
                    }
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
                ResponseBlock::Unknown => debug!("Ignoring response block"),
            }
        }

        let stop_reason = match self.stop_reason.as_deref() {
            Some("end_turn") | None => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            Some("stop_sequence") => StopReason::StopSequence,
            Some(other) => StopReason::Other(other.to_string()),
        };

        Ok(ModelResponse {
            model: self.model,
            content,
            stop_reason,
        })
    }
}
