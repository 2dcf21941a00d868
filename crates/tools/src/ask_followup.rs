//! ask_followup_question: ask the user for information the model cannot find
//! on its own.
//!
//! `follow_up` may carry `<suggest>` entries; they are offered to the user
//! (and to the bridge) as ready-made answers.

use async_trait::async_trait;
use serde_json::json;
use tasklane_core::error::ToolError;
use tasklane_core::message::{AskKind, SayKind};
use tasklane_core::tool::{Tool, ToolContext, ToolGroup, ToolOutput, ToolParam, ToolParams};
use tracing::debug;

const PARAMS: &[ToolParam] = &[
    ToolParam::required("question", "The question to ask the user"),
    ToolParam::optional(
        "follow_up",
        "2-4 suggested answers, each in its own <suggest></suggest> tag",
    ),
];

pub struct AskFollowupTool;

/// Pull the bodies of `<suggest>` tags, in order. Unclosed trailing tags are ignored.
pub fn parse_suggestions(follow_up: &str) -> Vec<String> {
    const OPEN: &str = "<suggest>";
    const CLOSE: &str = "</suggest>";
    let mut out = Vec::new();
    let mut rest = follow_up;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else { break };
        let item = after[..end].trim();
        if !item.is_empty() {
            out.push(item.to_string());
        }
        rest = &after[end + CLOSE.len()..];
    }
    out
}

#[async_trait]
impl Tool for AskFollowupTool {
    fn name(&self) -> &str {
        "ask_followup_question"
    }

    fn description(&self) -> &str {
        "Ask the user a question to gather information needed to complete the task. Use sparingly; prefer tools that can find the answer."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        None
    }

    fn describe(&self, params: &ToolParams) -> String {
        format!(
            "[ask_followup_question for '{}']",
            params.get("question").map(String::as_str).unwrap_or("")
        )
    }

    async fn execute(&self, ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let question = params.get("question").map(String::as_str).unwrap_or_default().trim();
        let suggest = params
            .get("follow_up")
            .map(|f| parse_suggestions(f))
            .unwrap_or_default();

        let text = json!({ "question": question, "suggest": suggest }).to_string();
        let response = ctx.channel.ask(AskKind::Followup, &text).await?;

        let answer = response.text.clone().unwrap_or_default();
        debug!(task_id = %ctx.task_id, "Follow-up question answered");
        ctx.channel.say(SayKind::UserFeedback, &answer);

        let mut output = ToolOutput::text(format!("<answer>\n{answer}\n</answer>"));
        output.images = response.images;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use tasklane_core::message::AskResponse;

    #[test]
    fn suggestions_are_extracted_in_order() {
        let raw = "<suggest>Use tabs</suggest>\n<suggest> Use spaces </suggest><suggest>unterminated";
        assert_eq!(parse_suggestions(raw), vec!["Use tabs", "Use spaces"]);
        assert!(parse_suggestions("no tags").is_empty());
    }

    #[tokio::test]
    async fn answer_is_wrapped_and_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, channel) = context(dir.path());
        channel.respond_with(AskResponse::message("src/main.rs"));

        let params = ToolParams::from([
            ("question".to_string(), "Which file?".to_string()),
            (
                "follow_up".to_string(),
                "<suggest>src/main.rs</suggest><suggest>src/lib.rs</suggest>".to_string(),
            ),
        ]);
        let out = AskFollowupTool.execute(&ctx, &params).await.unwrap();
        assert_eq!(out.content, "<answer>\nsrc/main.rs\n</answer>");

        let asks = channel.asks();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].0, AskKind::Followup);
        let body: serde_json::Value = serde_json::from_str(&asks[0].1).unwrap();
        assert_eq!(body["suggest"][1], "src/lib.rs");

        assert_eq!(channel.says(), vec![(SayKind::UserFeedback, "src/main.rs".to_string())]);
    }
}
