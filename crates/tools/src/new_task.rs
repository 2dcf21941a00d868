//! new_task: delegate a piece of work to a sub-task in another mode.
//!
//! The tool only validates and describes the request. The loop sees the
//! `SpawnSubtask` effect, pauses this task and hands the message to the
//! scheduler.

use async_trait::async_trait;
use serde_json::json;
use tasklane_core::error::ToolError;
use tasklane_core::message::AskKind;
use tasklane_core::mode::{Mode, find_mode};
use tasklane_core::tool::{
    ApprovalRequest, Tool, ToolContext, ToolEffect, ToolGroup, ToolOutput, ToolParam, ToolParams,
};

const PARAMS: &[ToolParam] = &[
    ToolParam::required("mode", "The slug of the mode to start the new task in (e.g. \"code\")"),
    ToolParam::required("message", "The initial instructions for the new task"),
];

pub struct NewTaskTool {
    modes: Vec<Mode>,
}

impl NewTaskTool {
    pub fn new(modes: &[Mode]) -> Self {
        Self { modes: modes.to_vec() }
    }
}

#[async_trait]
impl Tool for NewTaskTool {
    fn name(&self) -> &str {
        "new_task"
    }

    fn description(&self) -> &str {
        "Create a new sub-task in the chosen mode. This task pauses until the sub-task completes and then receives its result."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        None
    }

    fn validate(&self, params: &ToolParams) -> Result<(), ToolError> {
        for param in PARAMS {
            if params.get(param.name).is_none_or(|v| v.trim().is_empty()) {
                return Err(ToolError::MissingParameter {
                    tool_name: self.name().to_string(),
                    param: param.name.to_string(),
                });
            }
        }
        let slug = params.get("mode").map(|m| m.trim()).unwrap_or_default();
        if find_mode(&self.modes, slug).is_none() {
            let known: Vec<&str> = self.modes.iter().map(|m| m.slug.as_str()).collect();
            return Err(ToolError::InvalidArguments(format!(
                "unknown mode '{slug}'; available modes: {}",
                known.join(", ")
            )));
        }
        Ok(())
    }

    fn describe(&self, params: &ToolParams) -> String {
        format!(
            "[new_task in {} mode: '{}']",
            params.get("mode").map(String::as_str).unwrap_or(""),
            params.get("message").map(String::as_str).unwrap_or("")
        )
    }

    fn approval(&self, params: &ToolParams) -> Option<ApprovalRequest> {
        Some(ApprovalRequest {
            kind: AskKind::Tool,
            text: json!({
                "tool": "newTask",
                "mode": params.get("mode"),
                "content": params.get("message"),
            })
            .to_string(),
        })
    }

    async fn execute(&self, _ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let slug = params.get("mode").map(|m| m.trim()).unwrap_or_default();
        let message = params.get("message").map(String::as_str).unwrap_or_default().trim();
        let mode = find_mode(&self.modes, slug)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown mode '{slug}'")))?;

        Ok(ToolOutput::text(format!(
            "Successfully created new task in {} mode with message: {message}",
            mode.name
        ))
        .with_effect(ToolEffect::SpawnSubtask {
            mode: mode.slug.clone(),
            message: message.to_string(),
        }))
    }
}
