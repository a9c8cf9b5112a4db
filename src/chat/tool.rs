use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Represents a function definition for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    /// Name of the function
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema describing the parameters
    pub parameters: Value,
}

/// Represents a tool that can be used in chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// The type of tool (e.g. "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function definition if this is a function tool
    pub function: FunctionTool,
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// A tool call requested by the model, reassembled from streamed fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id
    pub id: String,
    /// Name of the function to call
    pub name: String,
    /// Raw JSON arguments as sent by the model
    pub arguments: String,
}

/// Display-only content a tool wants shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowingContent {
    pub content: String,
    pub kind: String,
}

/// Result of a successful tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Text sent back to the model as the tool message
    pub content: String,
    pub showing: Option<ShowingContent>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            showing: None,
        }
    }

    pub fn with_showing(mut self, content: impl Into<String>, kind: impl Into<String>) -> Self {
        self.showing = Some(ShowingContent {
            content: content.into(),
            kind: kind.into(),
        });
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

/// A function the model may call during a generation.
#[async_trait]
pub trait ChatTool: Send + Sync {
    fn name(&self) -> &str;

    /// Definition advertised to the provider.
    fn definition(&self) -> Tool;

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolError>;

    /// Human-readable form of the raw arguments for the `ToolCall` event.
    fn render_arguments(&self, raw: &str) -> String {
        serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
            .unwrap_or_else(|| raw.to_string())
    }
}

/// Tools available to one generation, resolved by name.
#[derive(Clone, Default)]
pub struct ToolTable {
    tools: HashMap<String, Arc<dyn ChatTool>>,
}

impl ToolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ChatTool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with(mut self, tool: Arc<dyn ChatTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChatTool>> {
        self.tools.get(name)
    }

    /// Definitions of every registered tool, ordered by name.
    pub fn definitions(&self) -> Vec<Tool> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolTable").field("tools", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ChatTool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn definition(&self) -> Tool {
            Tool::function(self.0, "test tool", json!({"type": "object"}))
        }

        async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(self.0))
        }
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let table = ToolTable::new()
            .with(Arc::new(Named("weather")))
            .with(Arc::new(Named("calculator")));

        let names: Vec<String> = table
            .definitions()
            .into_iter()
            .map(|tool| tool.function.name)
            .collect();

        assert_eq!(names, vec!["calculator", "weather"]);
    }

    #[test]
    fn tool_definition_serializes_as_function() {
        let tool = Tool::function("sum", "adds", json!({"type": "object"}));
        let value = serde_json::to_value(&tool).unwrap();

        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "sum");
    }

    #[test]
    fn render_arguments_pretty_prints_valid_json() {
        let tool = Named("x");
        assert_eq!(tool.render_arguments(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
        assert_eq!(tool.render_arguments("{broken"), "{broken");
    }
}
