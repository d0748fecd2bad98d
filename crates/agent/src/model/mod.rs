//! Provider-neutral model contract and the concrete API clients.

pub mod anthropic;
pub mod http;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use crate::config::{ModelConfig, Provider};
use crate::error::AgentResult;
use async_trait::async_trait;
use std::sync::Arc;
use switchyard_core::conversation::{ContentBlock, ToolInvocation, Turn};
use switchyard_core::tool::InternalTool;

/// One completion request
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub messages: Vec<Turn>,
    pub tools: Vec<InternalTool>,
    pub max_tokens: u32,
}

impl ModelRequest {
    pub fn new(messages: Vec<Turn>, max_tokens: u32) -> Self {
        Self {
            system: None,
            messages,
            tools: Vec::new(),
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn with_tools(mut self, tools: Vec<InternalTool>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    /// Name used in sampling results
    pub fn as_protocol(&self) -> &str {
        match self {
            Self::EndTurn => "endTurn",
            Self::ToolUse => "toolUse",
            Self::MaxTokens => "maxTokens",
            Self::StopSequence => "stopSequence",
            Self::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ModelResponse {
    /// Non-blank text blocks joined with newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn tool_invocations(&self) -> Vec<ToolInvocation> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolInvocation {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// A chat model that can request tool calls.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: ModelRequest) -> AgentResult<ModelResponse>;
}

/// Build the client for the configured provider.
pub fn client_for(config: ModelConfig) -> AgentResult<Arc<dyn ModelClient>> {
    Ok(match config.provider {
        Provider::Anthropic => Arc::new(AnthropicClient::new(config)?),
        Provider::OpenAi => Arc::new(OpenAiClient::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_helpers() {
        let response = ModelResponse {
            model: "m".into(),
            content: vec![
                ContentBlock::text("  "),
                ContentBlock::text("Let me add those."),
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "add".into(),
                    input: json!({"a": 2, "b": 3}),
                },
            ],
            stop_reason: StopReason::ToolUse,
        };

        assert_eq!(response.text(), "Let me add those.");
        assert_eq!(response.first_text(), Some("  "));
        let calls = response.tool_invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input["b"], 3);
        assert_eq!(response.stop_reason.as_protocol(), "toolUse");
    }
}
