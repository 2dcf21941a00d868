//! attempt_completion: present the final result.
//!
//! The result is shown to the user, then the tool asks whether the work is
//! accepted. Approval ends the task; feedback goes back to the model as the
//! tool result so it can keep working.

use async_trait::async_trait;
use tasklane_core::error::ToolError;
use tasklane_core::message::{AskKind, ResponseKind, SayKind};
use tasklane_core::tool::{
    Tool, ToolContext, ToolEffect, ToolGroup, ToolOutput, ToolParam, ToolParams,
};
use tracing::info;

const PARAMS: &[ToolParam] = &[
    ToolParam::required(
        "result",
        "The final result of the task. Do not end with a question or an offer of further help.",
    ),
    ToolParam::optional("command", "A command that demonstrates the result"),
];

pub struct AttemptCompletionTool;

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        "attempt_completion"
    }

    fn description(&self) -> &str {
        "Once the task is done and every tool result has confirmed success, present the result to the user."
    }

    fn params(&self) -> &[ToolParam] {
        PARAMS
    }

    fn group(&self) -> Option<ToolGroup> {
        None
    }

    async fn execute(&self, ctx: &ToolContext, params: &ToolParams) -> Result<ToolOutput, ToolError> {
        let result = params.get("result").map(String::as_str).unwrap_or_default().trim();
        let mut shown = result.to_string();
        if let Some(command) = params.get("command").filter(|c| !c.trim().is_empty()) {
            shown.push_str(&format!("\n\nTo see the result, run: {}", command.trim()));
        }
        ctx.channel.say(SayKind::CompletionResult, &shown);

        // A sub-task hands its result straight back to the parent
        if ctx.parent_id.is_some() {
            info!(task_id = %ctx.task_id, "Sub-task finished");
            return Ok(ToolOutput::default().with_effect(ToolEffect::Complete {
                result: result.to_string(),
            }));
        }

        let response = ctx.channel.ask(AskKind::CompletionResult, "").await?;

        if response.response == ResponseKind::Approve {
            info!(task_id = %ctx.task_id, "Completion accepted");
            return Ok(ToolOutput::default().with_effect(ToolEffect::Complete {
                result: result.to_string(),
            }));
        }

        let Some(feedback) = response.feedback() else {
            return Ok(ToolOutput::text(
                "The user did not accept the result and gave no feedback. Review the work, fix what is missing, and attempt completion again.",
            ));
        };
        ctx.channel.say(SayKind::UserFeedback, feedback);
        let mut output = ToolOutput::text(format!(
            "The user has provided feedback on the results. Consider their input to continue the task, and then attempt completion again.\n<feedback>\n{feedback}\n</feedback>"
        ));
        output.images = response.images.clone();
        Ok(output)
    }
}
