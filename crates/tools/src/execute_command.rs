//! execute_command: run a shell command in the workspace.
//!
//! Commands always go through the approval gate unless the `command` group is
//! auto-approved. Output is streamed back to the UI as a `command_output`
//! message once the process exits.

use async_trait::async_trait;
use tasklane_core::error::ToolError;
use tasklane_core::message::{AskKind, SayKind};
use tasklane_core::tool::{
    ApprovalRequest, Tool, ToolContext, ToolGroup, ToolOutput, ToolParam, ToolParams,
};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::workspace;

/// Output beyond this is cut from the middle.
const MAX_OUTPUT_CHARS: usize = 20_000;

const PARAMS: &[ToolParam] = &[
    ToolParam::required("command", "The CLI command to execute"),
    ToolParam::optional("cwd", "Working directory, relative to the workspace"),
];

pub struct ExecuteCommandTool;

fn truncate_middle(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let half = MAX_OUTPUT_CHARS / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    format!(
        "{head}\n\n[... {} characters omitted ...]\n\n{tail}",
        chars.len() - MAX_OUTPUT_CHARS
    )
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a CLI command on the system. Prefer non-interactive commands; the command is killed if it exceeds the configured timeout."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        Some(ToolGroup::Command)
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn describe(&self, params: &ToolParams) -> String {
        format!(
            "[execute_command for '{}']",
            params.get("command").map(String::as_str).unwrap_or("")
        )
    }

    fn approval(&self, params: &ToolParams) -> Option<ApprovalRequest> {
        Some(ApprovalRequest {
            kind: AskKind::Command,
            text: params.get("command").cloned().unwrap_or_default(),
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let command = params.get("command").map(String::as_str).unwrap_or_default();
        let cwd = match params.get("cwd").filter(|c| !c.trim().is_empty()) {
            Some(rel) => workspace::resolve(&ctx.workspace, rel, self.name())?,
            None => ctx.workspace.clone(),
        };

        debug!(task_id = %ctx.task_id, command = %command, "Executing command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&cwd).kill_on_drop(true);

        let timeout_secs = ctx.command_timeout.as_secs();
        let output = match tokio::time::timeout(ctx.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: "execute_command".into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(task_id = %ctx.task_id, command = %command, timeout_secs, "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: "execute_command".into(),
                    timeout_secs,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (_, true) => stdout.trim().to_string(),
            (true, false) => stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", stdout.trim(), stderr.trim()),
        };
        let combined = truncate_middle(&combined);
        let code = output.status.code().unwrap_or(-1);

        if !combined.is_empty() {
            ctx.channel.say(SayKind::CommandOutput, &combined);
        }

        let mut shown_cwd = workspace::display(&ctx.workspace, &cwd);
        if shown_cwd.is_empty() {
            shown_cwd = ".".into();
        }
        Ok(ToolOutput::text(format!(
            "Command executed in '{shown_cwd}'. Exit code: {code}\nOutput:\n{combined}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let (ctx, channel) = context(dir.path());
        let params = ToolParams::from([("command".to_string(), "ls".to_string())]);
        let out = ExecuteCommandTool.execute(&ctx, &params).await.unwrap();
        assert!(out.content.contains("Exit code: 0"));
        assert!(out.content.contains("marker.txt"));
        assert_eq!(channel.says().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _channel) = context(dir.path());
        let params = ToolParams::from([("command".to_string(), "exit 3".to_string())]);
        let out = ExecuteCommandTool.execute(&ctx, &params).await.unwrap();
        assert!(out.content.contains("Exit code: 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _channel) = context(dir.path());
        ctx.command_timeout = Duration::from_millis(100);
        let params = ToolParams::from([("command".to_string(), "sleep 5".to_string())]);
        let err = ExecuteCommandTool.execute(&ctx, &params).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[test]
    fn long_output_is_cut_in_the_middle() {
        let text = "x".repeat(MAX_OUTPUT_CHARS + 100);
        let cut = truncate_middle(&text);
        assert!(cut.contains("[... 100 characters omitted ...]"));
    }

    #[test]
    fn approval_asks_command_kind() {
        let params = ToolParams::from([("command".to_string(), "cargo test".to_string())]);
        let req = ExecuteCommandTool.approval(&params).unwrap();
        assert_eq!(req.kind, AskKind::Command);
        assert_eq!(req.text, "cargo test");
    }
}
