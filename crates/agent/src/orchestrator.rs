//! Multi-round tool-use loop between a model and the connected servers.

use crate::context::ContextSelector;
use crate::error::{AgentError, AgentResult};
use crate::model::{ModelClient, ModelRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use switchyard_core::content::{render_items, ResultItem};
use switchyard_core::conversation::{ContentBlock, ConversationState, ToolInvocation};
use switchyard_core::tool::InternalTool;
use switchyard_mcp::{McpError, McpResult, SessionGroup};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ROUNDS: usize = 25;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Returned when the model finishes without any text.
pub const NO_TEXT_RESPONSE: &str = "[No text response available]";

/// Where the orchestrator sends tool calls.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    /// Tool definitions handed to the model
    fn tools(&self) -> Vec<InternalTool>;

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Vec<ResultItem>>;
}

#[async_trait]
impl ToolCaller for SessionGroup {
    fn tools(&self) -> Vec<InternalTool> {
        self.list_tools()
            .iter()
            .map(|entry| InternalTool::from(&entry.item))
            .collect()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Vec<ResultItem>> {
        SessionGroup::call_tool(self, name, Some(arguments)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    AwaitingUserInput,
    ModelRequested,
    ToolsRequested,
    ToolsExecuting,
    FinalAnswer,
}

pub struct ToolOrchestrator {
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolCaller>,
    context: Option<ContextSelector>,
    conversation: ConversationState,
    state: OrchestratorState,
    max_rounds: usize,
    max_tokens: u32,
}

impl ToolOrchestrator {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<dyn ToolCaller>) -> Self {
        Self {
            model,
            tools,
            context: None,
            conversation: ConversationState::new(),
            state: OrchestratorState::AwaitingUserInput,
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_context(mut self, selector: ContextSelector) -> Self {
        self.context = Some(selector);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Run one user exchange to its final answer.
    ///
    /// On error the state returns to `AwaitingUserInput` and the partial
    /// conversation is kept for inspection.
    pub async fn handle_user_input(&mut self, input: &str) -> AgentResult<String> {
        let outcome = self.run_exchange(input).await;
        self.state = OrchestratorState::AwaitingUserInput;
        outcome
    }

    async fn run_exchange(&mut self, input: &str) -> AgentResult<String> {
        let mut user = vec![ContentBlock::text(input)];
        let mut system = None;
        if let Some(selector) = &self.context {
            let selected = selector.select(input).await;
            user.extend(selected.blocks);
            system = selected.system;
        }

        let exchange = self.conversation.begin(user, system);
        let tools = self.tools.tools();
        debug!(exchange = %exchange, tools = tools.len(), "Starting exchange");

        for round in 1..=self.max_rounds {
            self.state = OrchestratorState::ModelRequested;
            let request = ModelRequest::new(self.conversation.turns().to_vec(), self.max_tokens)
                .with_system(self.conversation.system().map(str::to_string))
                .with_tools(tools.clone());
            let response = self.model.complete(request).await?;

            let invocations = response.tool_invocations();
            self.conversation.push_assistant(response.content.clone());

            if invocations.is_empty() {
                self.state = OrchestratorState::FinalAnswer;
                info!(exchange = %exchange, rounds = round, "Exchange complete");
                let text = response.text();
                return Ok(if text.is_empty() {
                    NO_TEXT_RESPONSE.to_string()
                } else {
                    text
                });
            }

            self.state = OrchestratorState::ToolsRequested;
            debug!(
                round = round,
                calls = invocations.len(),
                stop_reason = ?response.stop_reason,
                "Model requested tools"
            );

            self.state = OrchestratorState::ToolsExecuting;
            let results = self.execute(&invocations).await;
            self.conversation.push_tool_results(results);
        }

        warn!(exchange = %exchange, rounds = self.max_rounds, "Tool loop limit reached");
        Err(AgentError::ToolLoopLimit {
            rounds: self.max_rounds,
        })
    }

    /// Run every invocation concurrently. Results keep the invocation order.
    async fn execute(&self, invocations: &[ToolInvocation]) -> Vec<ContentBlock> {
        let calls = invocations.iter().map(|call| {
            let tools = Arc::clone(&self.tools);
            async move {
                info!(tool = %call.name, id = %call.id, "Calling tool");
                match tools.call_tool(&call.name, call.input.clone()).await {
                    Ok(items) => ContentBlock::tool_result(&call.id, render_items(&items)),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool call failed");
                        ContentBlock::tool_error(&call.id, failure_text(&e))
                    }
                }
            }
        });
        futures::future::join_all(calls).await
    }
}

fn failure_text(err: &McpError) -> String {
    match err {
        McpError::RemoteTool { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{ModelResponse, StopReason};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use switchyard_core::conversation::Role;
    use switchyard_mcp::tools::calculator;
    use switchyard_mcp::{CallbackRouter, SessionConfig};

    /// Replays canned responses and records every request.
    pub(crate) struct ScriptedModel {
        responses: Mutex<VecDeque<ModelResponse>>,
        pub(crate) requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: ModelRequest) -> AgentResult<ModelResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::InvalidResponse("script exhausted".into()))
        }
    }

    pub(crate) fn text(text: &str) -> ModelResponse {
        ModelResponse {
            model: "scripted".into(),
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
        }
    }

    fn tool_use(calls: &[(&str, &str, Value)]) -> ModelResponse {
        ModelResponse {
            model: "scripted".into(),
            content: calls
                .iter()
                .map(|(id, name, input)| ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                })
                .collect(),
            stop_reason: StopReason::ToolUse,
        }
    }

    pub(crate) async fn calculator_group() -> SessionGroup {
        let group = SessionGroup::new(CallbackRouter::new(), SessionConfig::default());
        let (transport, _handle) = calculator::server().spawn_in_process();
        group.connect_transport("calculator", transport).await.unwrap();
        group
    }

    #[tokio::test]
    async fn test_add_then_final_answer() {
        let group = calculator_group().await;
        let model = ScriptedModel::new(vec![
            tool_use(&[("toolu_1", "add", json!({"a": 2, "b": 3}))]),
            text("The sum is 5."),
        ]);
        let mut orchestrator = ToolOrchestrator::new(model.clone(), Arc::new(group.clone()));

        let answer = orchestrator.handle_user_input("What is 2 + 3?").await.unwrap();
        assert_eq!(answer, "The sum is 5.");
        assert_eq!(orchestrator.state(), OrchestratorState::AwaitingUserInput);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 7);

        let feedback = requests[1].messages.last().unwrap();
        assert_eq!(feedback.role, Role::Tool);
        assert_eq!(
            feedback.content,
            vec![ContentBlock::tool_result("toolu_1", "2 + 3 = 5")]
        );

        // user, assistant tool_use, tool results, final assistant
        assert_eq!(orchestrator.conversation().len(), 4);
        group.disconnect_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back() {
        let group = calculator_group().await;
        let model = ScriptedModel::new(vec![
            tool_use(&[
                ("t1", "divide", json!({"a": 1, "b": 0})),
                ("t2", "nonexistent", json!({})),
                ("t3", "multiply", json!({"a": 4, "b": 2})),
            ]),
            text("Division by zero is undefined; 4 × 2 = 8."),
        ]);
        let mut orchestrator = ToolOrchestrator::new(model.clone(), Arc::new(group));

        let answer = orchestrator.handle_user_input("compute things").await.unwrap();
        assert!(answer.starts_with("Division by zero"));

        let requests = model.requests.lock().unwrap();
        let results = &requests[1].messages.last().unwrap().content;
        assert_eq!(results.len(), 3);

        match &results[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "t1");
                assert!(*is_error);
                assert!(content.contains("Division by zero"));
            }
            other => panic!("unexpected block {:?}", other),
        }
        assert!(matches!(
            &results[1],
            ContentBlock::ToolResult { is_error: true, content, .. } if content.contains("Unknown tool")
        ));
        assert_eq!(results[2], ContentBlock::tool_result("t3", "4 × 2 = 8"));
    }

    #[tokio::test]
    async fn test_loop_limit() {
        let group = calculator_group().await;
        let model = ScriptedModel::new(
            (0..3)
                .map(|i| tool_use(&[(format!("t{}", i).as_str(), "add", json!({"a": i, "b": 1}))]))
                .collect(),
        );
        let mut orchestrator =
            ToolOrchestrator::new(model.clone(), Arc::new(group)).with_max_rounds(2);

        let err = orchestrator.handle_user_input("loop forever").await.unwrap_err();
        assert!(matches!(err, AgentError::ToolLoopLimit { rounds: 2 }));
        assert_eq!(orchestrator.state(), OrchestratorState::AwaitingUserInput);
        assert_eq!(model.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_new_exchange_resets_conversation() {
        let group = calculator_group().await;
        let model = ScriptedModel::new(vec![text("hello"), text("")]);
        let mut orchestrator = ToolOrchestrator::new(model.clone(), Arc::new(group));

        assert_eq!(orchestrator.handle_user_input("hi").await.unwrap(), "hello");
        assert_eq!(
            orchestrator.handle_user_input("again").await.unwrap(),
            NO_TEXT_RESPONSE
        );

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[1].messages.len(), 1);
        assert_eq!(requests[1].messages[0].text(), "again");
    }

    #[tokio::test]
    async fn test_model_error_returns_to_idle() {
        let group = calculator_group().await;
        let model = ScriptedModel::new(vec![]);
        let mut orchestrator = ToolOrchestrator::new(model, Arc::new(group));

        assert!(orchestrator.handle_user_input("hi").await.is_err());
        assert_eq!(orchestrator.state(), OrchestratorState::AwaitingUserInput);
    }
}
