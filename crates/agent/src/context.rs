//! Picks resources and prompts relevant to a user request.
//!
//! The model is shown the catalog and answers with a JSON array of keys.
//! Selected resources become extra user content; selected prompts become
//! system instructions. Every failure here degrades to "no context".

use crate::error::{AgentError, AgentResult};
use crate::model::{ModelClient, ModelRequest};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use switchyard_core::content::ResourceContents;
use switchyard_core::conversation::{ContentBlock, Role, Turn};
use switchyard_mcp::SessionGroup;
use tracing::{debug, warn};

const SELECTION_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectedContext {
    pub blocks: Vec<ContentBlock>,
    pub system: Option<String>,
}

pub struct ContextSelector {
    model: Arc<dyn ModelClient>,
    group: SessionGroup,
}

impl ContextSelector {
    pub fn new(model: Arc<dyn ModelClient>, group: SessionGroup) -> Self {
        Self { model, group }
    }

    pub async fn select(&self, input: &str) -> SelectedContext {
        let mut selected = SelectedContext::default();

        let resources: Vec<(String, String, Option<String>)> = self
            .group
            .list_resources()
            .into_iter()
            .map(|e| (e.item.uri, e.item.name, e.item.description))
            .collect();
        if !resources.is_empty() {
            match self.choose(input, "resources", "uri", &resources).await {
                Ok(uris) => {
                    for uri in uris {
                        let name = resources
                            .iter()
                            .find(|(u, _, _)| *u == uri)
                            .map(|(_, n, _)| n.clone())
                            .unwrap_or_else(|| uri.clone());
                        self.load_resource(&uri, &name, &mut selected.blocks).await;
                    }
                }
                Err(e) => warn!(error = %e, "Resource selection failed"),
            }
        }

        // prompts with required arguments cannot be loaded blind
        let prompts: Vec<(String, String, Option<String>)> = self
            .group
            .list_prompts()
            .into_iter()
            .filter(|e| !e.item.arguments.iter().any(|a| a.required == Some(true)))
            .map(|e| (e.item.name.clone(), e.item.name, e.item.description))
            .collect();
        if !prompts.is_empty() {
            match self.choose(input, "prompts", "name", &prompts).await {
                Ok(names) => {
                    let mut parts = Vec::new();
                    for name in names {
                        match self.group.get_prompt(&name, BTreeMap::new()).await {
                            Ok(prompt) => parts.extend(
                                prompt
                                    .messages
                                    .into_iter()
                                    .filter_map(|m| m.content.as_text().map(str::to_string)),
                            ),
                            Err(e) => warn!(prompt = %name, error = %e, "Failed to load prompt"),
                        }
                    }
                    if !parts.is_empty() {
                        selected.system = Some(parts.join("\n\n"));
                    }
                }
                Err(e) => warn!(error = %e, "Prompt selection failed"),
            }
        }

        debug!(
            blocks = selected.blocks.len(),
            system = selected.system.is_some(),
            "Context selected"
        );
        selected
    }

    /// Ask the model which `(key, name, description)` candidates apply.
    async fn choose(
        &self,
        input: &str,
        kind: &str,
        key: &str,
        candidates: &[(String, String, Option<String>)],
    ) -> AgentResult<Vec<String>> {
        let listing: Vec<String> = candidates
            .iter()
            .map(|(k, name, description)| match description {
                Some(d) => format!("- {}: {} ({})", k, name, d),
                None => format!("- {}: {}", k, name),
            })
            .collect();
        let question = format!(
            "User request: {}\n\nAvailable {}:\n{}\n\nReply with only a JSON array of the {} \
             of the {} relevant to the request, or [] if none are.",
            input,
            kind,
            listing.join("\n"),
            key,
            kind
        );

        let response = self
            .model
            .complete(ModelRequest::new(
                vec![Turn::new(Role::User, vec![ContentBlock::text(question)])],
                SELECTION_MAX_TOKENS,
            ))
            .await?;

        let known: HashSet<&str> = candidates.iter().map(|(k, _, _)| k.as_str()).collect();
        let mut chosen = parse_selection(&response.text())?;
        chosen.retain(|k| known.contains(k.as_str()));
        chosen.dedup();
        Ok(chosen)
    }

    async fn load_resource(&self, uri: &str, name: &str, blocks: &mut Vec<ContentBlock>) {
        let result = match self.group.read_resource(uri).await {
            Ok(result) => result,
            Err(e) => {
                warn!(uri = %uri, error = %e, "Failed to load resource");
                return;
            }
        };

        for contents in result.contents {
            match contents {
                ResourceContents::Text(t) => {
                    blocks.push(ContentBlock::text(format!("[Resource: {}]\n{}", name, t.text)));
                }
                ResourceContents::Blob(b) => match b.mime_type {
                    Some(mime) if mime.starts_with("image/") => blocks.push(ContentBlock::Image {
                        media_type: mime,
                        data: b.blob,
                    }),
                    other => debug!(uri = %uri, mime_type = ?other, "Skipping binary resource"),
                },
            }
        }
    }
}

/// Take the JSON array between the first `[` and the last `]`.
fn parse_selection(answer: &str) -> AgentResult<Vec<String>> {
    let (Some(start), Some(end)) = (answer.find('['), answer.rfind(']')) else {
        return Err(AgentError::InvalidResponse(format!(
            "No JSON array in selection: {}",
            answer
        )));
    };
    if end < start {
        return Err(AgentError::InvalidResponse("Malformed selection".to_string()));
    }
    Ok(serde_json::from_str(&answer[start..=end])?)
}
