//! Ask/Say channel: a task's UI message log plus its single pending-ask slot.
//!
//! `post` is fire-and-forget. `ask` posts the same way, then suspends until
//! exactly one of these happens:
//!
//! - a responder resolves the pending ask (first writer wins)
//! - a newer message is appended, which supersedes the ask
//! - the task is cancelled
//!
//! Every message gets a timestamp from a per-task monotonic clock. The
//! timestamp is the message's identity: updating a partial message in place
//! keeps it. The same clock stamps model-facing history so that checkpoint
//! truncation can compare the two logs.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tasklane_core::channel::{Resolution, UserChannel};
use tasklane_core::error::AskError;
use tasklane_core::event::{DomainEvent, EventBus};
use tasklane_core::message::{
    AskKind, AskResponse, MessageKind, SayKind, TaskId, TokenAccounting, UiMessage, now_millis,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct PendingAsk {
    ts: i64,
    kind: AskKind,
    tx: oneshot::Sender<AskResponse>,
}

#[derive(Default)]
struct State {
    messages: Vec<UiMessage>,
    last_ts: i64,
    pending: Option<PendingAsk>,
}

impl State {
    fn next_ts(&mut self) -> i64 {
        let ts = now_millis().max(self.last_ts + 1);
        self.last_ts = ts;
        ts
    }
}

pub struct Messenger {
    task_id: TaskId,
    instance_id: String,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl Messenger {
    pub fn new(
        task_id: TaskId,
        instance_id: impl Into<String>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            instance_id: instance_id.into(),
            events,
            cancel,
            state: Mutex::new(State::default()),
        }
    }

    /// Seed the log, e.g. when resuming a task from storage.
    pub fn with_messages(self, messages: Vec<UiMessage>) -> Self {
        self.replace_messages(messages);
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a timestamp from this task's clock without posting anything.
    pub fn next_ts(&self) -> i64 {
        self.lock().next_ts()
    }

    /// Post a message and return its timestamp.
    ///
    /// A partial message of the same kind at the end of the log is updated in
    /// place (and finalized when `partial` is false). Anything else appends,
    /// which supersedes a pending ask.
    pub fn post(&self, kind: impl Into<MessageKind>, text: &str, partial: bool) -> i64 {
        let mut state = self.lock();
        self.post_locked(&mut state, kind.into(), text, partial)
    }

    fn post_locked(&self, state: &mut State, kind: MessageKind, text: &str, partial: bool) -> i64 {
        let text = (!text.is_empty()).then(|| text.to_string());

        if let Some(last) = state.messages.last_mut().filter(|m| m.partial && m.kind == kind) {
            last.text = text;
            last.partial = partial;
            let ts = last.ts;
            self.events.publish(DomainEvent::MessageUpdated {
                task_id: self.task_id.clone(),
                message: last.clone(),
            });
            return ts;
        }

        if let Some(pending) = state.pending.take() {
            debug!(task_id = %self.task_id, ask_ts = pending.ts, "Pending ask superseded by a newer message");
        }
        let ts = state.next_ts();
        let message = UiMessage::new(ts, kind, text, partial);
        state.messages.push(message.clone());
        self.events.publish(DomainEvent::MessageAppended {
            task_id: self.task_id.clone(),
            message,
        });
        ts
    }

    /// Complete informational message.
    pub fn say(&self, kind: SayKind, text: &str) -> i64 {
        self.post(kind, text, false)
    }

    /// Stream a partial ask without suspending (live tool previews).
    pub fn ask_partial(&self, kind: AskKind, text: &str) -> i64 {
        self.post(kind, text, true)
    }

    /// Post a question and wait for one response.
    pub async fn ask(&self, kind: AskKind, text: &str) -> Result<AskResponse, AskError> {
        if self.cancel.is_cancelled() {
            return Err(AskError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        let ts = {
            let mut state = self.lock();
            let ts = self.post_locked(&mut state, kind.into(), text, false);
            state.pending = Some(PendingAsk { ts, kind, tx });
            ts
        };

        self.events.publish(DomainEvent::AskPending {
            task_id: self.task_id.clone(),
            instance_id: self.instance_id.clone(),
            ask_ts: ts,
            kind,
            text: (!text.is_empty()).then(|| text.to_string()),
        });
        debug!(task_id = %self.task_id, ask_ts = ts, kind = ?kind, "Waiting for response");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.clear_pending(ts);
                Err(AskError::Cancelled)
            }
            response = rx => response.map_err(|_| AskError::Superseded { ask_ts: ts }),
        }
    }

    fn clear_pending(&self, ts: i64) {
        let mut state = self.lock();
        if state.pending.as_ref().is_some_and(|p| p.ts == ts) {
            state.pending = None;
        }
    }

    /// The resolution primitive. The first response wins; anything after it
    /// is stale and only logged.
    pub fn resolve(&self, response: AskResponse) -> Resolution {
        let pending = self.lock().pending.take();
        let Some(pending) = pending else {
            warn!(task_id = %self.task_id, "Ignoring response: no pending ask");
            return Resolution::Stale;
        };
        match pending.tx.send(response) {
            Ok(()) => {
                debug!(task_id = %self.task_id, ask_ts = pending.ts, "Ask resolved");
                Resolution::Accepted
            }
            Err(_) => {
                warn!(task_id = %self.task_id, ask_ts = pending.ts, "Ignoring response: ask already abandoned");
                Resolution::Stale
            }
        }
    }

    /// Timestamp and kind of the ask currently waiting, if any.
    pub fn pending_ask(&self) -> Option<(i64, AskKind)> {
        self.lock().pending.as_ref().map(|p| (p.ts, p.kind))
    }

    /// Attach token accounting to an `api_req_started` message.
    pub fn set_api_request(&self, ts: i64, accounting: TokenAccounting) {
        let mut state = self.lock();
        if let Some(message) = state.messages.iter_mut().find(|m| m.ts == ts) {
            message.api_request = Some(accounting);
            self.events.publish(DomainEvent::MessageUpdated {
                task_id: self.task_id.clone(),
                message: message.clone(),
            });
        }
    }

    /// Show a transient status on a message (retry countdowns).
    pub fn set_progress(&self, ts: i64, status: Option<String>) {
        let mut state = self.lock();
        if let Some(message) = state.messages.iter_mut().find(|m| m.ts == ts) {
            message.progress_status = status;
            self.events.publish(DomainEvent::MessageUpdated {
                task_id: self.task_id.clone(),
                message: message.clone(),
            });
        }
    }

    pub fn messages(&self) -> Vec<UiMessage> {
        self.lock().messages.clone()
    }

    pub fn last_message(&self) -> Option<UiMessage> {
        self.lock().messages.last().cloned()
    }

    /// Drop every message newer than `ts`.
    pub fn truncate_after(&self, ts: i64) {
        let mut state = self.lock();
        state.messages.retain(|m| m.ts <= ts);
        state.pending = None;
    }

    pub fn replace_messages(&self, messages: Vec<UiMessage>) {
        let mut state = self.lock();
        let newest = messages.iter().map(|m| m.ts).max().unwrap_or(0);
        state.last_ts = state.last_ts.max(newest);
        state.messages = messages;
        state.pending = None;
    }
}

#[async_trait]
impl UserChannel for Messenger {
    fn say(&self, kind: SayKind, text: &str) {
        Messenger::say(self, kind, text);
    }

    async fn ask(&self, kind: AskKind, text: &str) -> Result<AskResponse, AskError> {
        Messenger::ask(self, kind, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn messenger() -> Arc<Messenger> {
        Arc::new(Messenger::new(
            TaskId::from("t1"),
            "i1",
            Arc::new(EventBus::default()),
            CancellationToken::new(),
        ))
    }

    async fn wait_for_pending(m: &Messenger) -> i64 {
        for _ in 0..100 {
            if let Some((ts, _)) = m.pending_ask() {
                return ts;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("ask never became pending");
    }

    #[test]
    fn partial_updates_keep_timestamp() {
        let m = messenger();
        let ts = m.post(SayKind::Text, "Hel", true);
        assert_eq!(m.post(SayKind::Text, "Hello wor", true), ts);
        assert_eq!(m.post(SayKind::Text, "Hello world", false), ts);

        let log = m.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text.as_deref(), Some("Hello world"));
        assert!(!log[0].partial);

        // A finalized message is never updated again
        let next = m.post(SayKind::Text, "Next", true);
        assert!(next > ts);
        assert_eq!(m.messages().len(), 2);
    }

    #[test]
    fn timestamps_are_unique_and_monotonic() {
        let m = messenger();
        let mut last = 0;
        for _ in 0..50 {
            let ts = m.say(SayKind::Text, "x");
            assert!(ts > last);
            last = ts;
        }
        assert!(m.next_ts() > last);
    }

    #[tokio::test]
    async fn first_response_wins() {
        let m = messenger();
        let asker = {
            let m = m.clone();
            tokio::spawn(async move { m.ask(AskKind::Tool, "{}").await })
        };
        wait_for_pending(&m).await;

        assert_eq!(m.resolve(AskResponse::approve()), Resolution::Accepted);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(m.resolve(AskResponse::reject()), Resolution::Stale);

        let response = asker.await.unwrap().unwrap();
        assert_eq!(response, AskResponse::approve());
    }

    #[tokio::test]
    async fn resolving_with_nothing_pending_is_stale() {
        let m = messenger();
        assert_eq!(m.resolve(AskResponse::approve()), Resolution::Stale);
    }

    #[tokio::test]
    async fn newer_message_supersedes_ask() {
        let m = messenger();
        let asker = {
            let m = m.clone();
            tokio::spawn(async move { m.ask(AskKind::Followup, "Which?").await })
        };
        let ask_ts = wait_for_pending(&m).await;
        m.say(SayKind::Error, "something else happened");

        let err = asker.await.unwrap().unwrap_err();
        assert_eq!(err, AskError::Superseded { ask_ts });
        assert_eq!(m.resolve(AskResponse::approve()), Resolution::Stale);
    }

    #[tokio::test]
    async fn cancellation_ends_the_wait() {
        let m = messenger();
        let asker = {
            let m = m.clone();
            tokio::spawn(async move { m.ask(AskKind::Command, "ls").await })
        };
        wait_for_pending(&m).await;
        m.cancel_token().cancel();

        assert_eq!(asker.await.unwrap().unwrap_err(), AskError::Cancelled);
        assert!(m.pending_ask().is_none());
    }

    #[tokio::test]
    async fn ask_finalizes_partial_ask_in_place() {
        let m = messenger();
        let partial_ts = m.ask_partial(AskKind::Tool, "{\"path\":\"a");
        let asker = {
            let m = m.clone();
            tokio::spawn(async move { m.ask(AskKind::Tool, "{\"path\":\"a.rs\"}").await })
        };
        let ask_ts = wait_for_pending(&m).await;
        assert_eq!(ask_ts, partial_ts);
        assert_eq!(m.messages().len(), 1);

        assert_eq!(m.resolve(AskResponse::approve()), Resolution::Accepted);
        assert!(asker.await.unwrap().is_ok());
        assert!(!m.messages()[0].partial);
    }

    #[tokio::test]
    async fn ask_publishes_pending_event() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let m = Arc::new(Messenger::new(TaskId::from("t9"), "inst", bus, CancellationToken::new()));
        let asker = {
            let m = m.clone();
            tokio::spawn(async move { m.ask(AskKind::Followup, "Name?").await })
        };

        loop {
            let event = rx.recv().await.unwrap();
            if let DomainEvent::AskPending { instance_id, text, .. } = event.as_ref() {
                assert_eq!(instance_id, "inst");
                assert_eq!(text.as_deref(), Some("Name?"));
                break;
            }
        }
        m.resolve(AskResponse::message("Ada"));
        assert_eq!(asker.await.unwrap().unwrap().feedback(), Some("Ada"));
    }

    #[test]
    fn truncate_after_drops_newer_messages() {
        let m = messenger();
        let a = m.say(SayKind::Task, "task");
        let b = m.say(SayKind::CheckpointSaved, "abc");
        m.say(SayKind::Text, "later");
        m.truncate_after(b);
        let ts: Vec<i64> = m.messages().iter().map(|msg| msg.ts).collect();
        assert_eq!(ts, vec![a, b]);
    }
}
