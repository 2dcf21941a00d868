//! Tool trait: the capability interface every tool implements.
//!
//! Tools are invoked by the model with XML-style tags embedded in its text:
//!
//! ```text
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! The stream parser turns those tags into a name and a flat string map of
//! parameters. Adding a tool means registering an implementation here; the
//! dispatcher never switches on tool names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use crate::channel::UserChannel;
use crate::error::ToolError;
use crate::event::EventBus;
use crate::message::{AskKind, TaskId};

/// Parameters of one tool call, as parsed from the model's text.
pub type ToolParams = HashMap<String, String>;

/// Capability groups. A mode enables a set of groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolGroup {
    Read,
    Edit,
    Command,
}

/// Static description of one parameter.
#[derive(Debug, Clone, Copy)]
pub struct ToolParam {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

impl ToolParam {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self { name, required: true, description }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self { name, required: false, description }
    }
}

/// What a tool needs from its surroundings.
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    /// Set for sub-tasks.
    pub parent_id: Option<TaskId>,
    /// Root every path parameter is resolved against.
    pub workspace: PathBuf,
    pub events: Arc<EventBus>,
    pub channel: Arc<dyn UserChannel>,
    pub command_timeout: Duration,
}

/// Side effects on the task loop itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEffect {
    /// The task is finished.
    Complete { result: String },
    /// Pause this task and run a child in `mode`.
    SpawnSubtask { mode: String, message: String },
}

/// The result of a successful tool execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<ToolEffect>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_effect(mut self, effect: ToolEffect) -> Self {
        self.effect = Some(effect);
        self
    }
}

/// The question the approval gate asks before a finalized call runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub kind: AskKind,
    pub text: String,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tag name the model uses (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// The parameters this tool accepts, in prompt order.
    fn params(&self) -> &[ToolParam];

    /// `None` means always available, whatever the mode.
    fn group(&self) -> Option<ToolGroup>;

    /// Mutating tools are checkpointed around.
    fn is_mutating(&self) -> bool {
        false
    }

    /// A parameter whose value may contain text that looks like its own close
    /// tag (file contents). The parser takes it up to the last close tag.
    fn raw_body_param(&self) -> Option<&str> {
        None
    }

    /// Check that every required parameter is present and non-empty.
    fn validate(&self, params: &ToolParams) -> std::result::Result<(), ToolError> {
        for param in self.params().iter().filter(|p| p.required) {
            let present = params
                .get(param.name)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ToolError::MissingParameter {
                    tool_name: self.name().to_string(),
                    param: param.name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Short label for result headers, e.g. `[read_file for 'src/lib.rs']`.
    fn describe(&self, _params: &ToolParams) -> String {
        format!("[{}]", self.name())
    }

    /// Update a non-persistent live preview from a still-partial block.
    async fn preview(&self, _ctx: &ToolContext, _params: &ToolParams) {}

    /// The approval question for a finalized call. `None` runs ungated.
    fn approval(&self, _params: &ToolParams) -> Option<ApprovalRequest> {
        None
    }

    /// Perform the side effect.
    async fn execute(
        &self,
        ctx: &ToolContext,
        params: &ToolParams,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Usage text for the system prompt.
    fn usage(&self) -> String {
        let mut out = format!("## {}\nDescription: {}\nParameters:\n", self.name(), self.description());
        for p in self.params() {
            let req = if p.required { "required" } else { "optional" };
            out.push_str(&format!("- {}: ({}) {}\n", p.name, req, p.description));
        }
        out.push_str("Usage:\n");
        out.push_str(&format!("<{}>\n", self.name()));
        for p in self.params() {
            out.push_str(&format!("<{0}>{0} here</{0}>\n", p.name));
        }
        out.push_str(&format!("</{}>\n", self.name()));
        out
    }
}

/// A registry of available tools.
///
/// The agent uses this to:
/// 1. Build the parser vocabulary and the system prompt
/// 2. Look up a tool when a parsed block names it
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All registered tools, sorted by name.
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    const ECHO_PARAMS: &[ToolParam] = &[
        ToolParam::required("text", "Text to echo"),
        ToolParam::optional("times", "Repeat count"),
    ];

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "Echoes back the input" }
        fn params(&self) -> &[ToolParam] { ECHO_PARAMS }
        fn group(&self) -> Option<ToolGroup> { Some(ToolGroup::Read) }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            params: &ToolParams,
        ) -> std::result::Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(params.get("text").cloned().unwrap_or_default()))
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn default_validate_requires_non_empty() {
        let tool = EchoTool;
        let mut params = ToolParams::new();
        assert!(matches!(
            tool.validate(&params),
            Err(ToolError::MissingParameter { ref param, .. }) if param == "text"
        ));

        params.insert("text".into(), "   ".into());
        assert!(tool.validate(&params).is_err());

        params.insert("text".into(), "hi".into());
        assert!(tool.validate(&params).is_ok());
    }

    #[test]
    fn usage_lists_params() {
        let usage = EchoTool.usage();
        assert!(usage.contains("- text: (required)"));
        assert!(usage.contains("- times: (optional)"));
        assert!(usage.contains("<echo>"));
    }
}
