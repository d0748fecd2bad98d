use super::ElicitationHandler;
use crate::error::{McpError, McpResult};
use crate::schema::{ElicitAction, ElicitParams, ElicitResult};
use async_trait::async_trait;
use std::sync::Arc;
use switchyard_core::elicitation::{run_dialogue, ElicitationOutcome, FormPrompter};
use switchyard_core::ServerId;
use tokio::sync::Mutex;

/// Answers elicitation requests by running a form dialogue on a prompter.
///
/// Dialogues are serialized so concurrent requests from several servers do
/// not interleave on one terminal.
pub struct FormElicitationHandler {
    prompter: Arc<dyn FormPrompter>,
    turn: Mutex<()>,
}

impl FormElicitationHandler {
    pub fn new(prompter: Arc<dyn FormPrompter>) -> Self {
        Self {
            prompter,
            turn: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ElicitationHandler for FormElicitationHandler {
    async fn elicit(&self, server: &ServerId, params: ElicitParams) -> McpResult<ElicitResult> {
        let _turn = self.turn.lock().await;

        let message = format!("[{}] {}", server, params.message);
        let outcome = run_dialogue(&message, &params.requested_schema, self.prompter.as_ref())
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        tracing::debug!(server = %server, action = outcome.action(), "Elicitation answered");

        Ok(match outcome {
            ElicitationOutcome::Accept(answers) => ElicitResult {
                action: ElicitAction::Accept,
                content: Some(answers),
            },
            ElicitationOutcome::Decline => ElicitResult {
                action: ElicitAction::Decline,
                content: None,
            },
            ElicitationOutcome::Cancel => ElicitResult {
                action: ElicitAction::Cancel,
                content: None,
            },
        })
    }
}
