//! Answers server `sampling/createMessage` requests with the host's model.

use crate::model::{ModelClient, ModelRequest};
use async_trait::async_trait;
use std::sync::Arc;
use switchyard_core::content::Content;
use switchyard_core::conversation::{ContentBlock, Role, Turn};
use switchyard_mcp::callbacks::SamplingHandler;
use switchyard_mcp::schema::{CreateMessageParams, CreateMessageResult, MessageRole, SamplingMessage};
use switchyard_mcp::{McpError, McpResult};
use tracing::{debug, warn};

pub struct ModelSampler {
    model: Arc<dyn ModelClient>,
}

impl ModelSampler {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

fn turn(message: &SamplingMessage) -> Turn {
    let role = match message.role {
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    };
    let block = match &message.content {
        Content::Text { text } => ContentBlock::text(text),
        other => ContentBlock::text(serde_json::to_string(other).unwrap_or_default()),
    };
    Turn::new(role, vec![block])
}

#[async_trait]
impl SamplingHandler for ModelSampler {
    async fn create_message(&self, params: CreateMessageParams) -> McpResult<CreateMessageResult> {
        debug!(
            messages = params.messages.len(),
            max_tokens = params.max_tokens,
            "Sampling request"
        );

        let request = ModelRequest::new(params.messages.iter().map(turn).collect(), params.max_tokens)
            .with_system(params.system_prompt.clone());

        let response = self.model.complete(request).await.map_err(|e| {
            warn!(error = %e, "Sampling model call failed");
            McpError::Handler(format!("Model request failed: {}", e))
        })?;

        let text = response
            .first_text()
            .ok_or_else(|| McpError::Handler("Model returned no text".to_string()))?;

        Ok(CreateMessageResult {
            role: MessageRole::Assistant,
            content: Content::text(text),
            model: response.model.clone(),
            stop_reason: Some(response.stop_reason.as_protocol().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{text, ScriptedModel};
    use serde_json::json;

    fn params() -> CreateMessageParams {
        serde_json::from_value(json!({
            "messages": [
                {"role": "user", "content": {"type": "text", "text": "Summarize the log"}},
                {"role": "user", "content": {"type": "image", "data": "aGk=", "mimeType": "image/png"}}
            ],
            "systemPrompt": "You are terse.",
            "maxTokens": 100
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_bridges_to_model() {
        let model = ScriptedModel::new(vec![text("All quiet.")]);
        let sampler = ModelSampler::new(model.clone());

        let result = sampler.create_message(params()).await.unwrap();
        assert_eq!(result.role, MessageRole::Assistant);
        assert_eq!(result.content, Content::text("All quiet."));
        assert_eq!(result.model, "scripted");
        assert_eq!(result.stop_reason.as_deref(), Some("endTurn"));

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].system.as_deref(), Some("You are terse."));
        assert_eq!(requests[0].max_tokens, 100);
        assert!(requests[0].tools.is_empty());
        assert!(requests[0].messages[1].text().contains("image/png"));
    }

    #[tokio::test]
    async fn test_model_failure_is_handler_error() {
        let sampler = ModelSampler::new(ScriptedModel::new(vec![]));
        let err = sampler.create_message(params()).await.unwrap_err();
        assert!(matches!(err, McpError::Handler(_)));
    }
}
