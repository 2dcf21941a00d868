//! read_file: return a file's contents with line numbers.

use async_trait::async_trait;
use serde_json::json;
use tasklane_core::error::ToolError;
use tasklane_core::message::AskKind;
use tasklane_core::tool::{
    ApprovalRequest, Tool, ToolContext, ToolGroup, ToolOutput, ToolParam, ToolParams,
};

use crate::workspace;

/// Files larger than this are refused rather than flooding the context.
const MAX_BYTES: u64 = 1024 * 1024;

const PARAMS: &[ToolParam] = &[ToolParam::required(
    "path",
    "The path of the file to read (relative to the workspace)",
)];

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. The output is prefixed with line numbers (e.g. \"1 | fn main() {\")."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        Some(ToolGroup::Read)
    }

    fn describe(&self, params: &ToolParams) -> String {
        format!("[read_file for '{}']", params.get("path").map(String::as_str).unwrap_or(""))
    }

    fn approval(&self, params: &ToolParams) -> Option<ApprovalRequest> {
        Some(ApprovalRequest {
            kind: AskKind::Tool,
            text: json!({ "tool": "readFile", "path": params.get("path") }).to_string(),
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let rel = params.get("path").map(String::as_str).unwrap_or_default();
        let path = workspace::resolve(&ctx.workspace, rel, self.name())?;

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "read_file".into(),
            reason,
        };

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| failed(format!("{rel}: {e}")))?;
        if meta.is_dir() {
            return Err(ToolError::InvalidArguments(format!(
                "'{rel}' is a directory; use list_files instead"
            )));
        }
        if meta.len() > MAX_BYTES {
            return Err(failed(format!("{rel} is {} bytes, larger than the 1 MiB limit", meta.len())));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| failed(format!("{rel}: {e}")))?;
        let content = String::from_utf8_lossy(&bytes);

        Ok(ToolOutput::text(number_lines(&content)))
    }
}

fn number_lines(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let width = lines.len().to_string().len();
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>width$} | {}", i + 1, line, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;

    #[tokio::test]
    async fn reads_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "alpha\nbeta\n").unwrap();
        let (ctx, _channel) = context(dir.path());

        let params = ToolParams::from([("path".to_string(), "hello.txt".to_string())]);
        let out = ReadFileTool.execute(&ctx, &params).await.unwrap();
        assert_eq!(out.content, "1 | alpha\n2 | beta");
    }

    #[tokio::test]
    async fn directory_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let (ctx, _channel) = context(dir.path());

        let params = ToolParams::from([("path".to_string(), "src".to_string())]);
        let err = ReadFileTool.execute(&ctx, &params).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn missing_file_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _channel) = context(dir.path());
        let params = ToolParams::from([("path".to_string(), "nope.txt".to_string())]);
        let err = ReadFileTool.execute(&ctx, &params).await.unwrap_err();
        assert!(!err.is_validation());
    }

    #[test]
    fn line_numbers_are_right_aligned() {
        let text = (1..=10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let numbered = number_lines(&text);
        assert!(numbered.starts_with(" 1 | 1"));
        assert!(numbered.ends_with("10 | 10"));
    }
}
