//! OpenAI Responses API client.

use super::http::HttpClient;
use super::{ModelClient, ModelRequest, ModelResponse, StopReason};
use crate::config::ModelConfig;
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use switchyard_core::conversation::{ContentBlock, Role, Turn};
use tracing::debug;

pub struct OpenAiClient {
    http: HttpClient,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> AgentResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Config("OpenAI API key is not set".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HttpClient::header_value(&format!("Bearer {}", api_key))?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            http: HttpClient::new(Arc::new(config), headers)?,
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.http.config().model
    }

    async fn complete(&self, request: ModelRequest) -> AgentResult<ModelResponse> {
        let body = request_body(self.model(), &request);
        let response: ResponsesResponse = self.http.post("responses", &body).await?;
        response.into_model_response()
    }
}

pub(crate) fn request_body(model: &str, request: &ModelRequest) -> Value {
    let input: Vec<Value> = request.messages.iter().flat_map(input_items).collect();

    let mut body = json!({
        "model": model,
        "input": input,
        "max_output_tokens": request.max_tokens,
    });
    if let Some(system) = &request.system {
        body["instructions"] = json!(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(|t| t.to_openai()).collect();
    }
    body
}

/// One turn becomes a message item plus one item per function call or output.
fn input_items(turn: &Turn) -> Vec<Value> {
    let mut items = Vec::new();
    let mut parts = Vec::new();

    for block in &turn.content {
        match (turn.role, block) {
            (Role::Assistant, ContentBlock::Text { text }) => {
                parts.push(json!({"type": "output_text", "text": text}));
            }
            (_, ContentBlock::Text { text }) => {
                parts.push(json!({"type": "input_text", "text": text}));
            }
            (_, ContentBlock::Image { media_type, data }) => parts.push(json!({
                "type": "input_image",
                "image_url": format!("data:{};base64,{}", media_type, data),
            })),
            (_, ContentBlock::ToolUse { id, name, input }) => items.push(json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": input.to_string(),
            })),
            (_, ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }) => {
                let output = if *is_error {
                    format!("Error: {}", content)
                } else {
                    content.clone()
                };
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_use_id,
                    "output": output,
                }));
            }
        }
    }

    if !parts.is_empty() {
        let role = match turn.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };
        items.insert(0, json!({"type": "message", "role": role, "content": parts}));
    }
    items
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    model: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    /// Reasoning and other items the loop does not use
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputPart {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

impl ResponsesResponse {
    fn into_model_response(self) -> AgentResult<ModelResponse> {
        let mut content = Vec::new();

        for item in self.output {
            match item {
                OutputItem::Message { content: parts } => {
                    for part in parts {
                        if let OutputPart::OutputText { text } = part {
                            content.push(ContentBlock::text(text));
                        }
                    }
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    if call_id.is_empty() || name.is_empty() {
                        return Err(AgentError::InvalidResponse(
                            "function_call without call_id or name".to_string(),
                        ));
                    }
                    let arguments = match arguments.trim() {
                        "" => "{}",
                        text => text,
                    };
                    let input: Value = serde_json::from_str(arguments).map_err(|e| {
                        AgentError::InvalidResponse(format!("function_call arguments: {}", e))
                    })?;
                    content.push(ContentBlock::ToolUse {
                        id: call_id,
                        name,
                        input,
                    });
                }
                OutputItem::Unknown => debug!("Ignoring output item"),
            }
        }

        let stop_reason = if content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
        {
            StopReason::ToolUse
        } else if self.status.as_deref() == Some("incomplete") {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        };

        Ok(ModelResponse {
            model: self.model,
            content,
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Provider, RetryPolicy};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenAiClient {
        let mut config = ModelConfig::new(Provider::OpenAi, "gpt-test")
            .with_api_key("sk-test")
            .with_base_url(url::Url::parse(&format!("{}/v1/", server.uri())).unwrap());
        config.retry = RetryPolicy::no_retry();
        OpenAiClient::new(config).unwrap()
    }

    #[test]
    fn test_tool_round_trip_items() {
        let request = ModelRequest::new(
            vec![
                Turn::new(Role::User, vec![ContentBlock::text("divide 1 by 0")]),
                Turn::new(
                    Role::Assistant,
                    vec![
                        ContentBlock::text("Dividing."),
                        ContentBlock::ToolUse {
                            id: "call_1".into(),
                            name: "divide".into(),
                            input: json!({"a": 1, "b": 0}),
                        },
                    ],
                ),
                Turn::new(Role::Tool, vec![ContentBlock::tool_error("call_1", "Division by zero")]),
            ],
            256,
        )
        .with_system(Some("be brief".into()));

        let body = request_body("gpt-test", &request);
        let input = body["input"].as_array().unwrap();
        assert_eq!(body["instructions"], "be brief");
        assert_eq!(input.len(), 4);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["role"], "assistant");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["arguments"], r#"{"a":1,"b":0}"#);
        assert_eq!(input[3]["type"], "function_call_output");
        assert_eq!(input[3]["output"], "Error: Division by zero");
    }

    #[tokio::test]
    async fn test_complete_parses_function_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-test", "max_output_tokens": 32})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "model": "gpt-test",
                "status": "completed",
                "output": [
                    {"type": "reasoning", "summary": []},
                    {"type": "function_call", "call_id": "call_1", "name": "add", "arguments": "{\"a\":2,\"b\":3}"}
                ]
            })))
            .mount(&server)
            .await;

        let response = client(&server)
            .complete(ModelRequest::new(
                vec![Turn::new(Role::User, vec![ContentBlock::text("add")])],
                32,
            ))
            .await
            .unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        let calls = response.tool_invocations();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].input["b"], 3);
    }

    #[tokio::test]
    async fn test_incomplete_is_max_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-test",
                "status": "incomplete",
                "output": [{"type": "message", "role": "assistant", "content": [
                    {"type": "output_text", "text": "The answer is"}
                ]}]
            })))
            .mount(&server)
            .await;

        let response = client(&server).complete(ModelRequest::new(vec![], 8)).await.unwrap();
        assert_eq!(response.stop_reason, StopReason::MaxTokens);
        assert_eq!(response.text(), "The answer is");
    }

    #[tokio::test]
    async fn test_bad_arguments_are_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-test",
                "output": [{"type": "function_call", "call_id": "c", "name": "add", "arguments": "{nope"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server).complete(ModelRequest::new(vec![], 8)).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_function_call_without_call_id_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-test",
                "output": [{"type": "function_call", "name": "add", "arguments": "{}"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server).complete(ModelRequest::new(vec![], 8)).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
    }

    #[test]
    fn test_empty_arguments_mean_no_input() {
        let response: ResponsesResponse = serde_json::from_value(json!({
            "model": "gpt-test",
            "output": [
                {"type": "function_call", "call_id": "c", "name": "now"},
                {"type": "message", "content": [{"type": "refusal", "refusal": "no"}]}
            ]
        }))
        .unwrap();
        let response = response.into_model_response().unwrap();
        assert_eq!(response.content.len(), 1);
        assert_eq!(response.tool_invocations()[0].input, json!({}));
    }
}
