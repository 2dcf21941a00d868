//! Tool dispatcher: runs at most one tool per assistant turn.
//!
//! For each finalized tool block:
//!
//! 1. Skip it if an earlier tool this turn was rejected or already ran
//! 2. Check the tool exists and the mode allows its group
//! 3. Validate parameters (a failure is a mistake, fed back to the model)
//! 4. Ask for approval unless the group is auto-approved
//! 5. Execute, checkpointing around mutating tools
//!
//! Partial blocks only refresh the tool's live preview.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tasklane_config::AutoApproveConfig;
use tasklane_core::error::{AskError, ToolError};
use tasklane_core::event::DomainEvent;
use tasklane_core::message::{ContentPart, ResponseKind, SayKind};
use tasklane_core::mode::Mode;
use tasklane_core::tool::{Tool, ToolContext, ToolEffect, ToolOutput, ToolRegistry};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::messenger::Messenger;
use crate::parser::ToolUse;

/// Per-turn flags and the content queued for the next user message.
#[derive(Debug, Default)]
pub struct TurnState {
    pub did_reject: bool,
    pub did_already_use_tool: bool,
    pub results: Vec<ContentPart>,
    pub effect: Option<ToolEffect>,
}

impl TurnState {
    fn push_text(&mut self, text: impl Into<String>) {
        self.results.push(ContentPart::text(text));
    }

    /// Queue one tool result and close the turn to further tools.
    fn push_result(&mut self, header: String, body: String, images: Vec<String>) {
        self.push_text(header);
        self.push_text(if body.is_empty() { "(tool did not return anything)".to_string() } else { body });
        self.results
            .extend(images.into_iter().map(|data| ContentPart::Image { data }));
        self.did_already_use_tool = true;
    }
}

/// Everything a dispatch touches on the task.
pub struct DispatchEnv<'a> {
    pub ctx: &'a ToolContext,
    pub messenger: &'a Messenger,
    pub mode: &'a Mode,
    pub checkpoints: &'a mut CheckpointManager,
    pub mistakes: &'a mut u32,
}

pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    auto_approve: AutoApproveConfig,
}

pub fn format_error(err: &dyn std::fmt::Display) -> String {
    format!("The tool execution failed with the following error:\n<error>\n{err}\n</error>")
}

pub(crate) const FORMAT_REMINDER: &str = "Retry with a complete tool call. Tools are invoked with XML-style tags, one tool per message:\n<tool_name>\n<parameter_name>value</parameter_name>\n</tool_name>";

impl Dispatcher {
    pub fn new(tools: Arc<ToolRegistry>, auto_approve: AutoApproveConfig) -> Self {
        Self { tools, auto_approve }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Handle one tool block. Only a cancelled ask is returned as an error;
    /// every other failure becomes a tool result.
    pub async fn dispatch(
        &self,
        env: &mut DispatchEnv<'_>,
        block: &ToolUse,
        turn: &mut TurnState,
    ) -> Result<(), AskError> {
        let tool = self.tools.get(&block.name);
        let describe = tool
            .as_ref()
            .map(|t| t.describe(&block.params))
            .unwrap_or_else(|| format!("[{}]", block.name));

        if turn.did_reject {
            if !block.partial {
                turn.push_text(format!(
                    "Skipping tool {describe} due to user rejecting a previous tool."
                ));
            }
            return Ok(());
        }
        if turn.did_already_use_tool {
            if !block.partial {
                turn.push_text(format!(
                    "Tool [{}] was not executed because a tool has already been used in this message. Only one tool may be used per message. You must assess the first tool's result before proceeding to use the next tool.",
                    block.name
                ));
            }
            return Ok(());
        }

        let tool = match self.check_available(tool, block, env.mode) {
            Ok(tool) => tool,
            Err(e) => {
                if !block.partial {
                    self.reject_invalid(env, turn, &describe, &e);
                }
                return Ok(());
            }
        };

        if block.partial {
            tool.preview(env.ctx, &block.params).await;
            return Ok(());
        }

        if let Err(e) = tool.validate(&block.params) {
            self.reject_invalid(env, turn, &describe, &e);
            return Ok(());
        }

        let mut approval_feedback = None;
        if let Some(request) = tool.approval(&block.params) {
            if self.auto_approve.covers(tool.group()) {
                debug!(task_id = %env.ctx.task_id, tool = %block.name, "Auto-approved");
            } else {
                let response = match env.messenger.ask(request.kind, &request.text).await {
                    Ok(response) => response,
                    Err(AskError::Cancelled) => return Err(AskError::Cancelled),
                    Err(e @ AskError::Superseded { .. }) => {
                        warn!(task_id = %env.ctx.task_id, tool = %block.name, error = %e, "Approval superseded");
                        turn.push_result(
                            format!("{describe} Result:"),
                            "The approval request was superseded before an answer arrived; the tool was not executed.".into(),
                            Vec::new(),
                        );
                        turn.did_reject = true;
                        return Ok(());
                    }
                };

                if response.response != ResponseKind::Approve {
                    let body = match response.feedback() {
                        Some(feedback) => {
                            env.messenger.say(SayKind::UserFeedback, feedback);
                            format!(
                                "The user denied this operation and provided the following feedback:\n<feedback>\n{feedback}\n</feedback>"
                            )
                        }
                        None => "The user denied this operation.".to_string(),
                    };
                    info!(task_id = %env.ctx.task_id, tool = %block.name, "Tool denied");
                    turn.push_result(format!("{describe} Result:"), body, response.images);
                    turn.did_reject = true;
                    return Ok(());
                }
                if let Some(feedback) = response.feedback() {
                    env.messenger.say(SayKind::UserFeedback, feedback);
                    approval_feedback = Some(feedback.to_string());
                }
            }
        }

        if tool.is_mutating() {
            env.checkpoints.ensure_initial(env.messenger).await;
        }

        let started = Instant::now();
        let result = tool.execute(env.ctx, &block.params).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        env.ctx.events.publish(DomainEvent::ToolExecuted {
            task_id: env.ctx.task_id.clone(),
            tool_name: block.name.clone(),
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        match result {
            Ok(output) => {
                debug!(task_id = %env.ctx.task_id, tool = %block.name, duration_ms, "Tool executed");
                *env.mistakes = 0;
                let ToolOutput { mut content, images, effect } = output;
                if let Some(feedback) = approval_feedback {
                    content.push_str(&format!(
                        "\n\nThe user approved this operation and provided the following context:\n<feedback>\n{feedback}\n</feedback>"
                    ));
                }
                turn.push_result(format!("{describe} Result:"), content, images);
                turn.effect = effect;
            }
            Err(ToolError::Interrupted(AskError::Cancelled)) => return Err(AskError::Cancelled),
            Err(e) => {
                warn!(task_id = %env.ctx.task_id, tool = %block.name, error = %e, "Tool failed");
                if e.is_validation() {
                    *env.mistakes += 1;
                }
                env.messenger.say(SayKind::Error, &format!("Error {describe}: {e}"));
                turn.push_result(format!("{describe} Result:"), format_error(&e), Vec::new());
            }
        }

        if tool.is_mutating() {
            env.checkpoints.save(&format!("after {}", block.name), env.messenger).await;
        }
        Ok(())
    }

    fn check_available(
        &self,
        tool: Option<Arc<dyn Tool>>,
        block: &ToolUse,
        mode: &Mode,
    ) -> Result<Arc<dyn Tool>, ToolError> {
        let tool = tool.ok_or_else(|| ToolError::NotFound(block.name.clone()))?;
        if !mode.allows(tool.group()) {
            return Err(ToolError::NotAllowed {
                tool_name: block.name.clone(),
                mode: mode.slug.clone(),
            });
        }
        Ok(tool)
    }

    /// A call that never reached execution: count the mistake, tell the user
    /// and the model.
    fn reject_invalid(&self, env: &mut DispatchEnv<'_>, turn: &mut TurnState, describe: &str, err: &ToolError) {
        *env.mistakes += 1;
        warn!(task_id = %env.ctx.task_id, error = %err, mistakes = *env.mistakes, "Invalid tool call");

        let notice = match err {
            ToolError::MissingParameter { tool_name, param } => {
                format!("Tried to use {tool_name} without value for required parameter '{param}'. Retrying...")
            }
            other => other.to_string(),
        };
        env.messenger.say(SayKind::Error, &notice);
        turn.push_result(
            format!("{describe} Result:"),
            format!("{}\n\n{FORMAT_REMINDER}", format_error(err)),
            Vec::new(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tasklane_core::event::EventBus;
    use tasklane_core::message::{AskKind, AskResponse, MessageKind, TaskId};
    use tasklane_core::tool::ToolParams;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dir: tempfile::TempDir,
        messenger: Arc<Messenger>,
        ctx: ToolContext,
        checkpoints: CheckpointManager,
        mistakes: u32,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let events = Arc::new(EventBus::default());
            let messenger = Arc::new(Messenger::new(
                TaskId::from("t"),
                "i",
                events.clone(),
                CancellationToken::new(),
            ));
            let ctx = ToolContext {
                task_id: TaskId::from("t"),
                parent_id: None,
                workspace: dir.path().to_path_buf(),
                events,
                channel: messenger.clone(),
                command_timeout: Duration::from_secs(5),
            };
            Self {
                dir,
                messenger,
                ctx,
                checkpoints: CheckpointManager::disabled(TaskId::from("t")),
                mistakes: 0,
            }
        }

        async fn run(&mut self, dispatcher: &Dispatcher, mode: &Mode, block: &ToolUse, turn: &mut TurnState) {
            let mut env = DispatchEnv {
                ctx: &self.ctx,
                messenger: &self.messenger,
                mode,
                checkpoints: &mut self.checkpoints,
                mistakes: &mut self.mistakes,
            };
            dispatcher.dispatch(&mut env, block, turn).await.unwrap();
        }
    }

    fn block(name: &str, params: &[(&str, &str)]) -> ToolUse {
        ToolUse {
            name: name.into(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<ToolParams>(),
            partial: false,
        }
    }

    fn dispatcher(auto: AutoApproveConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(tasklane_tools::default_registry(&Mode::defaults())), auto)
    }

    fn code_mode() -> Mode {
        Mode::defaults().remove(0)
    }

    fn text_of(turn: &TurnState) -> String {
        turn.results
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn missing_parameter_is_a_mistake_not_an_abort() {
        let mut fx = Fixture::new();
        let mut turn = TurnState::default();
        fx.run(&dispatcher(AutoApproveConfig::all()), &code_mode(), &block("read_file", &[]), &mut turn)
            .await;

        assert_eq!(fx.mistakes, 1);
        assert!(turn.did_already_use_tool);
        assert!(text_of(&turn).contains("Missing value for required parameter 'path'"));
        let last = fx.messenger.last_message().unwrap();
        assert!(last.text.unwrap().contains("without value for required parameter 'path'"));
    }

    #[tokio::test]
    async fn auto_approved_read_runs_and_resets_mistakes() {
        let mut fx = Fixture::new();
        std::fs::write(fx.dir.path().join("a.txt"), "hello").unwrap();
        fx.mistakes = 2;
        let mut turn = TurnState::default();
        fx.run(
            &dispatcher(AutoApproveConfig::all()),
            &code_mode(),
            &block("read_file", &[("path", "a.txt")]),
            &mut turn,
        )
        .await;

        assert_eq!(fx.mistakes, 0);
        assert_eq!(text_of(&turn), "[read_file for 'a.txt'] Result:\n1 | hello");
    }

    #[tokio::test]
    async fn only_one_tool_per_turn() {
        let mut fx = Fixture::new();
        std::fs::write(fx.dir.path().join("a.txt"), "x").unwrap();
        let d = dispatcher(AutoApproveConfig::all());
        let mode = code_mode();
        let mut turn = TurnState::default();
        fx.run(&d, &mode, &block("read_file", &[("path", "a.txt")]), &mut turn).await;
        fx.run(&d, &mode, &block("list_files", &[("path", ".")]), &mut turn).await;

        let text = text_of(&turn);
        assert!(text.contains("Tool [list_files] was not executed"));
        assert_eq!(text.matches("Result:").count(), 1);
    }

    #[tokio::test]
    async fn denial_with_feedback_skips_later_tools() {
        let mut fx = Fixture::new();
        let d = dispatcher(AutoApproveConfig::default());
        let mode = code_mode();
        let messenger = fx.messenger.clone();
        let responder = tokio::spawn(async move {
            loop {
                if let Some((_, kind)) = messenger.pending_ask() {
                    assert_eq!(kind, AskKind::Command);
                    messenger.resolve(AskResponse::message("use cargo instead"));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let mut turn = TurnState::default();
        fx.run(&d, &mode, &block("execute_command", &[("command", "make")]), &mut turn).await;
        responder.await.unwrap();
        assert!(turn.did_reject);
        assert!(text_of(&turn).contains("<feedback>\nuse cargo instead\n</feedback>"));

        fx.run(&d, &mode, &block("read_file", &[("path", "a.txt")]), &mut turn).await;
        assert!(text_of(&turn).contains("Skipping tool [read_file for 'a.txt'] due to user rejecting a previous tool."));
    }

    #[tokio::test]
    async fn mode_restricts_tool_groups() {
        let mut fx = Fixture::new();
        let architect = Mode::defaults().remove(1);
        let mut turn = TurnState::default();
        fx.run(
            &dispatcher(AutoApproveConfig::all()),
            &architect,
            &block("write_to_file", &[("path", "a.txt"), ("content", "x")]),
            &mut turn,
        )
        .await;

        assert!(!fx.dir.path().join("a.txt").exists());
        assert!(text_of(&turn).contains("not allowed in architect mode"));
        assert_eq!(fx.mistakes, 1);
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let mut fx = Fixture::new();
        let mut turn = TurnState::default();
        fx.run(&dispatcher(AutoApproveConfig::all()), &code_mode(), &block("teleport", &[]), &mut turn)
            .await;
        assert!(text_of(&turn).contains("Tool not found: teleport"));
    }

    #[tokio::test]
    async fn partial_block_only_previews() {
        let mut fx = Fixture::new();
        let mut rx = fx.ctx.events.subscribe();
        let mut partial = block("write_to_file", &[("path", "new.txt"), ("content", "hal")]);
        partial.partial = true;
        let mut turn = TurnState::default();
        fx.run(&dispatcher(AutoApproveConfig::all()), &code_mode(), &partial, &mut turn).await;

        assert!(turn.results.is_empty());
        assert!(!turn.did_already_use_tool);
        assert!(!fx.dir.path().join("new.txt").exists());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.as_ref(), DomainEvent::DiffPreview { .. }));
    }

    #[tokio::test]
    async fn completion_effect_is_reported() {
        let mut fx = Fixture::new();
        let messenger = fx.messenger.clone();
        let responder = tokio::spawn(async move {
            loop {
                if messenger.pending_ask().is_some() {
                    messenger.resolve(AskResponse::approve());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        let mut turn = TurnState::default();
        fx.run(
            &dispatcher(AutoApproveConfig::default()),
            &code_mode(),
            &block("attempt_completion", &[("result", "done")]),
            &mut turn,
        )
        .await;
        responder.await.unwrap();
        assert_eq!(turn.effect, Some(ToolEffect::Complete { result: "done".into() }));
    }

    #[tokio::test]
    async fn edits_still_run_after_a_checkpoint_failure() {
        let mut fx = Fixture::new();
        let backend = Arc::new(crate::checkpoint::test_support::BrokenSnapshots::default());
        fx.checkpoints = CheckpointManager::new(
            TaskId::from("t"),
            backend.clone(),
            Duration::from_secs(15),
            fx.ctx.events.clone(),
        );
        let d = dispatcher(AutoApproveConfig::all());

        let mut turn = TurnState::default();
        fx.run(&d, &code_mode(), &block("write_to_file", &[("path", "a.txt"), ("content", "one")]), &mut turn)
            .await;
        assert!(text_of(&turn).contains("[write_to_file for 'a.txt'] Result:"));
        assert!(!fx.checkpoints.is_enabled());

        let mut turn = TurnState::default();
        fx.run(&d, &code_mode(), &block("write_to_file", &[("path", "b.txt"), ("content", "two")]), &mut turn)
            .await;
        assert!(text_of(&turn).contains("[write_to_file for 'b.txt'] Result:"));
        assert!(std::fs::read_to_string(fx.dir.path().join("b.txt")).unwrap().contains("two"));
        assert_eq!(backend.attempts(), 1);
        assert!(fx
            .messenger
            .messages()
            .iter()
            .all(|m| m.kind != MessageKind::from(SayKind::CheckpointSaved)));
    }
}
