//! Terminal responder: prints what a task says and answers its asks from
//! input lines.

use std::sync::Arc;
use tasklane_core::channel::{AskResponder, Resolution};
use tasklane_core::event::DomainEvent;
use tasklane_core::message::{MessageKind, SayKind, UiMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{describe_ask, parse_reply};

/// How a finished say message is shown, or `None` to keep it off the terminal.
pub fn render(message: &UiMessage) -> Option<String> {
    let MessageKind::Say { say } = message.kind else {
        return None;
    };
    let text = message.text.as_deref().unwrap_or_default();
    match say {
        SayKind::Task => Some(format!("Task: {text}")),
        SayKind::Text | SayKind::CommandOutput | SayKind::ApiReqRetryDelayed | SayKind::SubtaskResult => {
            (!text.is_empty()).then(|| text.to_string())
        }
        SayKind::Error => Some(format!("Error: {text}")),
        SayKind::CompletionResult => Some(format!("Result:\n{text}")),
        SayKind::CheckpointSaved => Some(format!("[checkpoint {}]", text.chars().take(12).collect::<String>())),
        SayKind::Reasoning | SayKind::ApiReqStarted | SayKind::UserFeedback => None,
    }
}

pub struct TerminalResponder {
    responder: Arc<dyn AskResponder>,
}

impl TerminalResponder {
    pub fn new(responder: Arc<dyn AskResponder>) -> Self {
        Self { responder }
    }

    /// Serve stdin and stdout until cancelled.
    pub async fn run(&self, events: broadcast::Receiver<Arc<DomainEvent>>, cancel: CancellationToken) {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.run_with(events, stdin, stdout, cancel).await;
    }

    pub async fn run_with<R, W>(
        &self,
        mut events: broadcast::Receiver<Arc<DomainEvent>>,
        input: R,
        mut output: W,
        cancel: CancellationToken,
    ) where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Terminal fell behind the event bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let out = match event.as_ref() {
                DomainEvent::MessageAppended { message, .. } | DomainEvent::MessageUpdated { message, .. }
                    if !message.partial =>
                {
                    render(message).map(|line| format!("{line}\n"))
                }
                DomainEvent::AskPending { task_id, instance_id, kind, text, .. } => {
                    let (question, suggestions) = describe_ask(*kind, text.as_deref());
                    let mut prompt = format!("\n{question}\n");
                    for (i, s) in suggestions.iter().enumerate() {
                        prompt.push_str(&format!("  {}. {s}\n", i + 1));
                    }
                    prompt.push_str("> ");
                    if write(&mut output, &prompt).await.is_err() {
                        break;
                    }

                    let line = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => line,
                    };
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!("Input closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read input");
                            break;
                        }
                    };
                    let response = parse_reply(*kind, &line, &suggestions);
                    match self.responder.respond(task_id, instance_id, response) {
                        Resolution::Accepted => None,
                        Resolution::Stale => Some("(already answered elsewhere)\n".to_string()),
                    }
                }
                DomainEvent::TaskAborted { reason, .. } => Some(format!("Task aborted: {reason}\n")),
                _ => None,
            };
            if let Some(out) = out {
                if write(&mut output, &out).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> std::io::Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.flush().await
}
