//! Provider-neutral tool definition handed to model APIs.

use crate::types::ToolDescriptor;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct InternalTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl InternalTool {
    pub fn new(name: impl Into<String>, description: Option<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description,
            input_schema,
        }
    }

    /// `{name, description, input_schema}`
    pub fn to_anthropic(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }

    /// `{type: "function", name, description, parameters}`
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema,
        })
    }
}

impl From<&ToolDescriptor> for InternalTool {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone().or_else(|| tool.title.clone()),
            input_schema: tool.input_schema.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_shapes() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "number"}}});
        let tool = InternalTool::from(
            &ToolDescriptor::new("add", schema.clone()).with_description("Add numbers"),
        );

        let anthropic = tool.to_anthropic();
        assert_eq!(anthropic["name"], "add");
        assert_eq!(anthropic["input_schema"], schema);
        assert!(anthropic.get("type").is_none());

        let openai = tool.to_openai();
        assert_eq!(openai["type"], "function");
        assert_eq!(openai["description"], "Add numbers");
        assert_eq!(openai["parameters"], schema);
    }
}
