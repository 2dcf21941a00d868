//! list_files: list a directory, optionally recursively.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use tasklane_core::error::ToolError;
use tasklane_core::message::AskKind;
use tasklane_core::tool::{
    ApprovalRequest, Tool, ToolContext, ToolGroup, ToolOutput, ToolParam, ToolParams,
};

use crate::workspace;

/// Stop listing after this many entries.
pub const MAX_ENTRIES: usize = 200;

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv"];

const PARAMS: &[ToolParam] = &[
    ToolParam::required("path", "The directory to list (relative to the workspace)"),
    ToolParam::optional("recursive", "\"true\" to list recursively"),
];

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories within the specified directory. Directories end with '/'."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        Some(ToolGroup::Read)
    }

    fn describe(&self, params: &ToolParams) -> String {
        format!("[list_files for '{}']", params.get("path").map(String::as_str).unwrap_or(""))
    }

    fn approval(&self, params: &ToolParams) -> Option<ApprovalRequest> {
        let recursive = is_recursive(params);
        Some(ApprovalRequest {
            kind: AskKind::Tool,
            text: json!({
                "tool": if recursive { "listFilesRecursive" } else { "listFilesTopLevel" },
                "path": params.get("path"),
            })
            .to_string(),
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let rel = params.get("path").map(String::as_str).unwrap_or(".");
        let dir = workspace::resolve(&ctx.workspace, rel, self.name())?;
        if !dir.is_dir() {
            return Err(ToolError::InvalidArguments(format!("'{rel}' is not a directory")));
        }

        let recursive = is_recursive(params);
        let (entries, truncated) = tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let truncated = walk(&dir, &dir, recursive, &mut entries);
            (entries, truncated)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "list_files".into(),
            reason: e.to_string(),
        })?;

        if entries.is_empty() {
            return Ok(ToolOutput::text("No files found."));
        }
        let mut out = entries.join("\n");
        if truncated {
            out.push_str(&format!(
                "\n\n(File list truncated at {MAX_ENTRIES} entries. Use list_files on specific subdirectories to explore further.)"
            ));
        }
        Ok(ToolOutput::text(out))
    }
}

fn is_recursive(params: &ToolParams) -> bool {
    params
        .get("recursive")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Collect sorted entries under `dir`. Returns true when the limit was hit.
pub fn walk(root: &Path, dir: &Path, recursive: bool, out: &mut Vec<String>) -> bool {
    let Ok(read) = std::fs::read_dir(dir) else {
        return false;
    };
    let mut children: Vec<_> = read.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for child in children {
        if out.len() >= MAX_ENTRIES {
            return true;
        }
        let path = child.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let is_dir = child.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            out.push(format!("{rel}/"));
            let name = child.file_name();
            let skip = SKIP_DIRS.iter().any(|s| name == *s);
            if recursive && !skip && walk(root, &path, true, out) {
                return true;
            }
        } else {
            out.push(rel);
        }
    }
    false
}
