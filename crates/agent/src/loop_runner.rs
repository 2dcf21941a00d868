//! The task loop: request → stream → present → dispatch, until a completion
//! is accepted or the task is aborted.
//!
//! Blocks are presented strictly in order as the stream grows. A cursor marks
//! the first block not yet finalized; everything before it has been said or
//! dispatched exactly once. Once a tool has run (or been rejected) the rest of
//! the response is dropped and the stored assistant text carries an
//! interruption marker.

use std::sync::Arc;
use std::time::Duration;
use tasklane_core::error::{AskError, ProviderError};
use tasklane_core::message::{
    ApiMessage, AskKind, ContentPart, MessageKind, ResponseKind, Role, SayKind, UiMessage, now_millis,
};
use tasklane_core::provider::{ModelRequest, StreamChunk, Usage};
use tasklane_core::tool::ToolEffect;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchEnv, FORMAT_REMINDER, TurnState};
use crate::parser::ContentBlock;
use crate::prompt;
use crate::retry;
use crate::scheduler::Runtime;
use crate::task::{Start, Task, TaskOutcome};
use crate::truncate;

const INTERRUPTED_BY_FEEDBACK: &str = "[Response interrupted by user feedback]";
const INTERRUPTED_BY_TOOL: &str = "[Response interrupted by a tool use result. Only one tool may be used at a time and should be placed at the end of the message.]";
const INTERRUPTED_BY_API_ERROR: &str = "[Response interrupted by API Error]";
const INTERRUPTED_BY_USER: &str = "[Response interrupted by user]";

const EMPTY_RESPONSE: &str = "Unexpected API Response: The language model did not provide any assistant messages. This may indicate an issue with the API or the model's output.";

const MISTAKE_LIMIT: &str = "This may indicate a failure in the model's thought process or inability to use a tool properly, which can be mitigated with some user guidance (e.g. \"Try breaking down the task into smaller steps\").";

type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// Why a loop stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Cancelled,
    Failed(String),
}

impl From<AskError> for Halt {
    fn from(e: AskError) -> Self {
        match e {
            AskError::Cancelled => Self::Cancelled,
            other => Self::Failed(other.to_string()),
        }
    }
}

impl Halt {
    fn into_outcome(self) -> TaskOutcome {
        let reason = match self {
            Self::Cancelled => "aborted".to_string(),
            Self::Failed(reason) => reason,
        };
        TaskOutcome::Aborted { reason }
    }
}

enum TurnEnd {
    Next(Vec<ContentPart>),
    Complete(String),
}

/// Everything one streamed response accumulates.
#[derive(Default)]
struct StreamState {
    buffer: String,
    reasoning: String,
    reasoning_done: bool,
    usage: Option<Usage>,
    cursor: usize,
    saw_tool: bool,
    interrupt: Option<&'static str>,
    turn: TurnState,
}

impl StreamState {
    fn add_usage(&mut self, usage: Usage) {
        let total = self.usage.get_or_insert_with(Usage::default);
        total.input_tokens += usage.input_tokens;
        total.output_tokens += usage.output_tokens;
        total.cache_write_tokens += usage.cache_write_tokens;
        total.cache_read_tokens += usage.cache_read_tokens;
        if let Some(cost) = usage.total_cost {
            *total.total_cost.get_or_insert(0.0) += cost;
        }
    }

    /// Reported usage, or an estimate when the stream was cut before the
    /// provider sent any.
    fn usage_or_estimate(&self, request: &ModelRequest) -> Usage {
        self.usage.clone().unwrap_or_else(|| {
            let input_chars = request.system_prompt.len()
                + request.messages.iter().map(ApiMessage::char_len).sum::<usize>();
            Usage {
                input_tokens: truncate::estimate_tokens(input_chars),
                output_tokens: truncate::estimate_tokens(self.buffer.len()),
                ..Usage::default()
            }
        })
    }

    fn assistant_text(&self, marker: Option<&str>) -> String {
        match marker {
            Some(marker) if self.buffer.trim().is_empty() => marker.to_string(),
            Some(marker) => format!("{}\n\n{marker}", self.buffer),
            None => self.buffer.clone(),
        }
    }
}

/// Text shown to the user: thinking tags removed, and while streaming, a
/// half-written tag at the end held back.
fn display_text(content: &str, partial: bool) -> String {
    let mut text = content.replace("<thinking>", "").replace("</thinking>", "");
    if partial {
        if let Some(open) = text.rfind('<') {
            let tail = &text[open + 1..];
            if tail.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/') {
                text.truncate(open);
            }
        }
    }
    text.trim().to_string()
}

fn text_of(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            ContentPart::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn no_tools_used() -> String {
    format!(
        "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.\n\n{FORMAT_REMINDER}\n\n# Next Steps\n\nIf you have completed the user's task, use the attempt_completion tool. If you require additional information from the user, use the ask_followup_question tool. Otherwise, if you have not completed the task and do not need additional information, then proceed with the next step of the task. (This is an automated message, so do not respond to it conversationally.)"
    )
}

/// Drop what a previous run left dangling at the end of the UI log: resume
/// asks and a request that never got its accounting. Everything left is final.
pub fn trim_for_resume(mut messages: Vec<UiMessage>) -> Vec<UiMessage> {
    while let Some(last) = messages.last() {
        let dangling = matches!(
            last.kind,
            MessageKind::Ask { ask: AskKind::ResumeTask | AskKind::ResumeCompletedTask }
        ) || (last.kind == MessageKind::from(SayKind::ApiReqStarted) && last.api_request.is_none());
        if !dangling {
            break;
        }
        messages.pop();
    }
    for message in &mut messages {
        message.partial = false;
    }
    messages
}

/// Whether the log ends on a completion (ignoring bookkeeping messages).
pub fn ended_with_completion(messages: &[UiMessage]) -> bool {
    messages
        .iter()
        .rev()
        .find(|m| {
            !matches!(
                m.kind,
                MessageKind::Say { say: SayKind::CheckpointSaved | SayKind::ApiReqStarted }
            )
        })
        .is_some_and(|m| {
            m.kind == MessageKind::from(AskKind::CompletionResult)
                || m.kind == MessageKind::from(SayKind::CompletionResult)
        })
}

fn ago(then_ms: i64, now_ms: i64) -> String {
    let minutes = (now_ms - then_ms).max(0) / 60_000;
    match minutes {
        0 => "just now".to_string(),
        1..=59 => format!("{minutes} minutes ago"),
        60..=1439 => format!("{} hours ago", minutes / 60),
        _ => format!("{} days ago", minutes / 1440),
    }
}

impl Runtime {
    pub(crate) async fn run_loop(self: &Arc<Self>, task: &mut Task, start: Start) -> TaskOutcome {
        let first = match start {
            Start::New { text, images } => Ok(self.initial_content(task, &text, images)),
            Start::Resume => self.resumption_content(task).await,
        };
        let mut user_content = match first {
            Ok(content) => content,
            Err(halt) => return halt.into_outcome(),
        };

        loop {
            match self.run_turn(task, user_content).await {
                Ok(TurnEnd::Next(next)) => user_content = next,
                Ok(TurnEnd::Complete(result)) => return TaskOutcome::Completed { result },
                Err(halt) => return halt.into_outcome(),
            }
        }
    }

    fn initial_content(&self, task: &Task, text: &str, images: Vec<String>) -> Vec<ContentPart> {
        task.messenger.say(SayKind::Task, text);
        let mut parts = vec![ContentPart::text(format!("<task>\n{text}\n</task>"))];
        parts.extend(images.into_iter().map(|data| ContentPart::Image { data }));
        parts.push(ContentPart::text(prompt::environment_details(&self.workspace, &task.mode, true)));
        parts
    }

    async fn resumption_content(&self, task: &mut Task) -> Result<Vec<ContentPart>, Halt> {
        let messages = trim_for_resume(task.messenger.messages());
        let last_ts = messages.last().map(|m| m.ts).unwrap_or_else(now_millis);
        let kind = if ended_with_completion(&messages) {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        task.checkpoints.recover(&messages);
        task.messenger.replace_messages(messages);

        let response = task.messenger.ask(kind, "").await?;
        if response.response == ResponseKind::Reject {
            return Err(Halt::Failed("resume declined".into()));
        }

        let mut parts = Vec::new();
        // Keep the history alternating: an unanswered user turn is folded in
        if task.api_history.last().is_some_and(|m| m.role == Role::User) {
            if let Some(last) = task.api_history.pop() {
                parts.extend(last.content);
            }
        }

        let mut text = format!(
            "[TASK RESUMPTION] This task was interrupted {}. It may or may not be complete, so please reassess the task context. Be aware that the project state may have changed since then. The current working directory is now '{}'. If the task has not been completed, retry the last step before interruption and proceed with completing the task.\n\nNote: If you previously attempted a tool use that the user did not provide a result for, you should assume the tool use was not successful and assess whether you should retry.",
            ago(last_ts, now_millis()),
            self.workspace.display()
        );
        if let Some(feedback) = response.feedback() {
            task.messenger.say(SayKind::UserFeedback, feedback);
            text.push_str(&format!(
                "\n\nNew instructions for task continuation:\n<user_message>\n{feedback}\n</user_message>"
            ));
        }
        parts.push(ContentPart::text(text));
        parts.extend(response.images.into_iter().map(|data| ContentPart::Image { data }));
        parts.push(ContentPart::text(prompt::environment_details(&self.workspace, &task.mode, true)));
        Ok(parts)
    }

    async fn run_turn(
        self: &Arc<Self>,
        task: &mut Task,
        mut user_content: Vec<ContentPart>,
    ) -> Result<TurnEnd, Halt> {
        if task.cancel().is_cancelled() {
            return Err(Halt::Cancelled);
        }

        if task.mistakes >= self.config.runtime.mistake_limit {
            let response = task.messenger.ask(AskKind::MistakeLimitReached, MISTAKE_LIMIT).await?;
            if response.response == ResponseKind::Reject {
                return Err(Halt::Failed("stopped after repeated mistakes".into()));
            }
            if let Some(feedback) = response.feedback() {
                task.messenger.say(SayKind::UserFeedback, feedback);
                user_content.push(ContentPart::text(format!(
                    "You seem to be having trouble proceeding. The user has provided the following feedback to help guide you:\n<feedback>\n{feedback}\n</feedback>"
                )));
            }
            user_content.extend(response.images.into_iter().map(|data| ContentPart::Image { data }));
            task.mistakes = 0;
        }

        let request_ts = task.messenger.say(SayKind::ApiReqStarted, &text_of(&user_content));
        task.push_user(user_content);

        let model = self.config.default_model.clone();
        let info = self.provider.model_info(&model);
        let max_output = info
            .max_output_tokens
            .unwrap_or(u64::from(self.config.default_max_tokens));
        let kept = truncate::truncate(&task.api_history, &task.last_accounting, info.context_window, max_output);
        if kept.len() < task.api_history.len() {
            info!(
                task_id = %task.id,
                dropped = task.api_history.len() - kept.len(),
                "Truncated conversation history"
            );
            task.api_history = kept;
        }
        self.persist(task).await;

        let request = ModelRequest {
            model: model.clone(),
            system_prompt: prompt::system_prompt(
                &task.mode,
                &self.modes,
                &self.tools,
                &self.workspace,
                self.config.custom_instructions.as_deref(),
            ),
            messages: task.api_history.clone(),
            temperature: self.config.default_temperature,
            max_tokens: Some(self.config.default_max_tokens),
        };

        let (first, rx) = self.open_stream(task, &request).await?;
        // Reserved now so checkpoints taken while dispatching sort after it
        let assistant_ts = task.messenger.next_ts();

        let mut st = StreamState::default();
        let streamed = self.stream_response(task, &mut st, first, rx).await;

        let accounting = self.pricing.accounting(&model, &st.usage_or_estimate(&request));
        task.messenger.set_api_request(request_ts, accounting.clone());
        task.last_accounting = accounting;

        if let Err(halt) = streamed {
            let marker = match halt {
                Halt::Cancelled => INTERRUPTED_BY_USER,
                Halt::Failed(_) => INTERRUPTED_BY_API_ERROR,
            };
            task.push_assistant(st.assistant_text(Some(marker)), assistant_ts);
            return Err(halt);
        }

        if st.buffer.trim().is_empty() {
            warn!(task_id = %task.id, "Model returned an empty response");
            task.messenger.say(SayKind::Error, EMPTY_RESPONSE);
            task.push_assistant("Failure: I did not provide a response.", assistant_ts);
        } else {
            task.push_assistant(st.assistant_text(st.interrupt), assistant_ts);
        }
        self.persist(task).await;

        let turn = std::mem::take(&mut st.turn);
        let mut next = turn.results;
        match turn.effect {
            Some(ToolEffect::Complete { result }) => return Ok(TurnEnd::Complete(result)),
            Some(ToolEffect::SpawnSubtask { mode, message }) => {
                let outcome = self.run_subtask(task, &mode, &message).await?;
                let report = outcome.report();
                task.messenger.say(SayKind::SubtaskResult, &report);
                next.push(ContentPart::text(report));
                return Ok(TurnEnd::Next(next));
            }
            None => {}
        }

        if !st.saw_tool {
            task.mistakes += 1;
            debug!(task_id = %task.id, mistakes = task.mistakes, "Response used no tool");
            next.push(ContentPart::text(no_tools_used()));
        }
        Ok(TurnEnd::Next(next))
    }

    /// Open the model stream and wait for its first chunk, retrying
    /// failures with backoff or by asking the user.
    async fn open_stream(
        &self,
        task: &Task,
        request: &ModelRequest,
    ) -> Result<(Option<StreamChunk>, ChunkReceiver), Halt> {
        let rt = &self.config.runtime;
        let mut attempt = 0u32;
        loop {
            self.wait_for_rate_limit(task).await?;

            let result = tokio::select! {
                biased;
                _ = task.cancel().cancelled() => return Err(Halt::Cancelled),
                result = self.first_chunk(request.clone()) => result,
            };
            let error = match result {
                Ok(opened) => return Ok(opened),
                Err(e) => e,
            };
            warn!(task_id = %task.id, attempt, error = %error, "Model request failed");

            if rt.auto_retry && attempt < rt.max_retries {
                let delay = retry::retry_delay(
                    rt.retry_base_delay_secs,
                    attempt,
                    error.retry_after_secs(),
                    rt.max_retry_delay_secs,
                );
                attempt += 1;
                retry::countdown(&task.messenger, delay, |secs| match secs {
                    0 => format!("{error}\n\nRetry attempt {attempt}\nRetrying now..."),
                    s => format!("{error}\n\nRetry attempt {attempt}\nRetrying in {s} seconds..."),
                })
                .await?;
                continue;
            }

            let response = task.messenger.ask(AskKind::ApiReqFailed, &error.to_string()).await?;
            if response.response != ResponseKind::Approve {
                return Err(Halt::Failed(format!("model request failed: {error}")));
            }
            attempt = 0;
        }
    }

    async fn first_chunk(
        &self,
        request: ModelRequest,
    ) -> Result<(Option<StreamChunk>, ChunkReceiver), ProviderError> {
        let timeout = Duration::from_secs(self.config.runtime.first_chunk_timeout_secs);
        let open = async {
            let mut rx = self.provider.stream(request).await?;
            match rx.recv().await {
                Some(Ok(chunk)) => Ok((Some(chunk), rx)),
                Some(Err(e)) => Err(e),
                None => Ok((None, rx)),
            }
        };
        tokio::time::timeout(timeout, open).await.map_err(|_| {
            ProviderError::Timeout(format!("no response within {}s", timeout.as_secs()))
        })?
    }

    async fn wait_for_rate_limit(&self, task: &Task) -> Result<(), Halt> {
        let limit = self.config.runtime.rate_limit_secs;
        if limit > 0 {
            let last = *self.last_request.lock().unwrap_or_else(|e| e.into_inner());
            let wait = retry::rate_limit_wait(last, Instant::now(), limit);
            if wait > 0 {
                retry::countdown(&task.messenger, wait, |secs| match secs {
                    0 => "Rate limiting: sending request now...".to_string(),
                    s => format!("Rate limiting for {s} seconds..."),
                })
                .await?;
            }
        }
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(())
    }

    /// Feed chunks through the parser and present blocks until the stream
    /// ends or a tool closes the turn.
    async fn stream_response(
        &self,
        task: &mut Task,
        st: &mut StreamState,
        first: Option<StreamChunk>,
        mut rx: ChunkReceiver,
    ) -> Result<(), Halt> {
        if let Some(chunk) = first {
            self.on_chunk(task, st, chunk).await?;
        }

        while st.interrupt.is_none() {
            let next = tokio::select! {
                biased;
                _ = task.cancel().cancelled() => return Err(Halt::Cancelled),
                next = rx.recv() => next,
            };
            match next {
                Some(Ok(chunk)) => self.on_chunk(task, st, chunk).await?,
                Some(Err(e)) => {
                    warn!(task_id = %task.id, error = %e, "Model stream failed mid-response");
                    task.messenger.say(SayKind::Error, &format!("API Error: {e}"));
                    return Err(Halt::Failed(format!("model stream failed: {e}")));
                }
                None => break,
            }
        }

        if st.interrupt.is_some() {
            debug!(task_id = %task.id, "Dropping the rest of the response");
            return Ok(());
        }

        self.finish_reasoning(task, st);
        // Stream over: anything still open is final now
        let mut blocks = self.parser.parse(&st.buffer, true);
        for block in &mut blocks {
            match block {
                ContentBlock::Text { partial, .. } => *partial = false,
                ContentBlock::ToolUse(tool) => tool.partial = false,
            }
        }
        self.present(task, st, &blocks).await
    }

    async fn on_chunk(&self, task: &mut Task, st: &mut StreamState, chunk: StreamChunk) -> Result<(), Halt> {
        match chunk {
            StreamChunk::Reasoning(text) => {
                st.reasoning.push_str(&text);
                task.messenger.post(SayKind::Reasoning, &st.reasoning, true);
            }
            StreamChunk::Usage(usage) => st.add_usage(usage),
            StreamChunk::Text(text) => {
                self.finish_reasoning(task, st);
                st.buffer.push_str(&text);
                let blocks = self.parser.parse(&st.buffer, false);
                self.present(task, st, &blocks).await?;

                if st.turn.did_reject {
                    st.interrupt = Some(INTERRUPTED_BY_FEEDBACK);
                } else if st.turn.did_already_use_tool {
                    st.interrupt = Some(INTERRUPTED_BY_TOOL);
                }
            }
        }
        Ok(())
    }

    fn finish_reasoning(&self, task: &Task, st: &mut StreamState) {
        if !st.reasoning.is_empty() && !st.reasoning_done {
            task.messenger.post(SayKind::Reasoning, &st.reasoning, false);
            st.reasoning_done = true;
        }
    }

    /// Present blocks from the cursor on. A partial block is presented and
    /// stays under the cursor; a final block is presented once and passed.
    async fn present(&self, task: &mut Task, st: &mut StreamState, blocks: &[ContentBlock]) -> Result<(), Halt> {
        while let Some(block) = blocks.get(st.cursor) {
            match block {
                ContentBlock::Text { content, partial } => {
                    // Nothing after a tool result or a rejection reaches the user
                    let silenced = st.turn.did_reject || st.turn.did_already_use_tool;
                    let text = display_text(content, *partial);
                    if !silenced && !text.is_empty() {
                        task.messenger.post(SayKind::Text, &text, *partial);
                    }
                }
                ContentBlock::ToolUse(tool_use) => {
                    st.saw_tool = true;
                    let mut env = DispatchEnv {
                        ctx: &task.ctx,
                        messenger: &task.messenger,
                        mode: &task.mode,
                        checkpoints: &mut task.checkpoints,
                        mistakes: &mut task.mistakes,
                    };
                    self.dispatcher.dispatch(&mut env, tool_use, &mut st.turn).await?;
                }
            }
            if block.is_partial() {
                break;
            }
            st.cursor += 1;
        }
        Ok(())
    }
}
