//! write_to_file: create or overwrite a file.
//!
//! `content` is the raw-body parameter: file contents may contain text that
//! looks like `</content>`, so the parser takes everything up to the last
//! close tag. While the block is still streaming, only a live preview is
//! published; nothing touches the disk until the call is finalized and
//! approved.

use async_trait::async_trait;
use serde_json::json;
use tasklane_core::error::ToolError;
use tasklane_core::event::DomainEvent;
use tasklane_core::message::AskKind;
use tasklane_core::tool::{
    ApprovalRequest, Tool, ToolContext, ToolGroup, ToolOutput, ToolParam, ToolParams,
};
use tracing::debug;

use crate::workspace;

const PARAMS: &[ToolParam] = &[
    ToolParam::required("path", "The path of the file to write (relative to the workspace)"),
    ToolParam::required("content", "The COMPLETE intended content of the file"),
    ToolParam::optional("line_count", "The number of lines in the file"),
];

pub struct WriteToFileTool;

/// Models often wrap file contents in a markdown fence. Drop it.
fn strip_code_fence(content: &str) -> String {
    let mut lines: Vec<&str> = content.lines().collect();
    if lines.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> &str {
        "write_to_file"
    }

    fn description(&self) -> &str {
        "Write full content to a file. Creates the file (and parent directories) if needed and overwrites it otherwise."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        Some(ToolGroup::Edit)
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn raw_body_param(&self) -> Option<&str> {
        Some("content")
    }

    fn describe(&self, params: &ToolParams) -> String {
        format!("[write_to_file for '{}']", params.get("path").map(String::as_str).unwrap_or(""))
    }

    async fn preview(&self, ctx: &ToolContext, params: &ToolParams) {
        let (Some(path), Some(content)) = (params.get("path"), params.get("content")) else {
            return;
        };
        ctx.events.publish(DomainEvent::DiffPreview {
            task_id: ctx.task_id.clone(),
            path: path.clone(),
            content: content.clone(),
        });
    }

    fn approval(&self, params: &ToolParams) -> Option<ApprovalRequest> {
        Some(ApprovalRequest {
            kind: AskKind::Tool,
            text: json!({
                "tool": "writeToFile",
                "path": params.get("path"),
                "content": params.get("content").map(|c| strip_code_fence(c)),
            })
            .to_string(),
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let rel = params.get("path").map(String::as_str).unwrap_or_default();
        let content = strip_code_fence(params.get("content").map(String::as_str).unwrap_or_default());
        let path = workspace::resolve(&ctx.workspace, rel, self.name())?;

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "write_to_file".into(),
            reason,
        };

        if path.is_dir() {
            return Err(ToolError::InvalidArguments(format!("'{rel}' is a directory")));
        }
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| failed(format!("{rel}: {e}")))?;

        debug!(task_id = %ctx.task_id, path = %rel, bytes = content.len(), existed, "File written");

        let mut message = format!(
            "The content was successfully saved to {}.",
            workspace::display(&ctx.workspace, &path)
        );
        if let Some(expected) = params.get("line_count").and_then(|c| c.trim().parse::<usize>().ok()) {
            let actual = content.lines().count();
            if expected != actual {
                message.push_str(&format!(
                    "\n\nNote: line_count was {expected} but the written file has {actual} lines. If the output was cut off, write the file again with its complete content."
                ));
            }
        }
        Ok(ToolOutput::text(message))
    }
}
