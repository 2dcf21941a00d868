//! Notification bridge: relays pending asks to an out-of-process channel and
//! routes replies back to the runtime's resolution primitive.
//!
//! One notification is outstanding per task at a time. A newer ask replaces
//! the older one; a reply consumes the outstanding entry, so a duplicate
//! reply finds nothing and is dropped.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tasklane_core::channel::{AskResponder, Resolution};
use tasklane_core::error::ChannelError;
use tasklane_core::event::DomainEvent;
use tasklane_core::message::{AskKind, AskResponse, TaskId};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wire message exchanged with a bridge transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub task_id: TaskId,
    pub instance_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub payload: NotificationPayload,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AskNotification,
    CompletionNotification,
    ResponseFromTelegram,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Notification {
    pub fn new(task_id: TaskId, instance_id: impl Into<String>, kind: NotificationKind) -> Self {
        Self {
            task_id,
            instance_id: instance_id.into(),
            kind,
            payload: NotificationPayload::default(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// A reply carrying the user's text for the task's outstanding question.
    pub fn reply(task_id: TaskId, instance_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut reply = Self::new(task_id, instance_id, NotificationKind::ResponseFromTelegram);
        reply.payload.result = Some(text.into());
        reply
    }
}

/// Where outgoing notifications go (a chat, a mailbox file).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// Where replies from a transport are handed off.
///
/// `Ok(Resolution::Stale)` means the reply arrived but nothing was waiting
/// for it; `Err` means it could not be handed off at all.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn hand_off(&self, reply: Notification) -> Result<Resolution, ChannelError>;
}

/// Turn an ask into a human question plus ready-made answers.
pub fn describe_ask(kind: AskKind, text: Option<&str>) -> (String, Vec<String>) {
    let text = text.unwrap_or_default();
    match kind {
        AskKind::Followup => {
            #[derive(Deserialize)]
            struct Followup {
                question: String,
                #[serde(default)]
                suggest: Vec<String>,
            }
            match serde_json::from_str::<Followup>(text) {
                Ok(f) => (f.question, f.suggest),
                Err(_) => (text.to_string(), Vec::new()),
            }
        }
        AskKind::Tool => {
            let summary = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| {
                    let tool = v.get("tool")?.as_str()?.to_string();
                    Some(match v.get("path").and_then(|p| p.as_str()) {
                        Some(path) => format!("{tool} on {path}"),
                        None => tool,
                    })
                })
                .unwrap_or_else(|| text.to_string());
            (format!("Allow {summary}?"), yes_no())
        }
        AskKind::Command => (format!("Run this command?\n{text}"), yes_no()),
        AskKind::CompletionResult => (
            "The task reports it is complete. Accept the result, or reply with feedback.".to_string(),
            yes_no(),
        ),
        AskKind::ApiReqFailed => (format!("The model request failed:\n{text}\nRetry?"), yes_no()),
        AskKind::MistakeLimitReached => (
            format!("{text}\nContinue, stop, or reply with guidance."),
            yes_no(),
        ),
        AskKind::ResumeTask | AskKind::ResumeCompletedTask => (
            "Resume this task? Reply with new instructions to add them.".to_string(),
            yes_no(),
        ),
    }
}

fn yes_no() -> Vec<String> {
    vec!["yes".to_string(), "no".to_string()]
}

/// Map a typed reply onto a response.
///
/// A bare number picks that suggestion. Follow-up questions always get a
/// message; everything else understands yes/no (and an empty line as yes).
pub fn parse_reply(kind: AskKind, text: &str, suggestions: &[String]) -> AskResponse {
    let text = text.trim();
    let text = text
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| suggestions.get(i))
        .map(String::as_str)
        .unwrap_or(text);

    if kind == AskKind::Followup {
        return AskResponse::message(text);
    }
    match text.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "approve" | "ok" => AskResponse::approve(),
        "n" | "no" | "reject" | "stop" => AskResponse::reject(),
        _ => AskResponse::message(text),
    }
}

#[derive(Debug, Clone)]
struct Outstanding {
    instance_id: String,
    kind: AskKind,
    suggestions: Vec<String>,
}

/// Watches the event bus and keeps one outstanding notification per task.
///
/// The sink is passed to [`run`](Self::run) rather than held, so a transport
/// can both receive notifications and hand replies back to the bridge.
pub struct NotificationBridge {
    responder: Arc<dyn AskResponder>,
    outstanding: Mutex<HashMap<TaskId, Outstanding>>,
}

impl NotificationBridge {
    pub fn new(responder: Arc<dyn AskResponder>) -> Self {
        Self {
            responder,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Outstanding>> {
        self.outstanding.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_outstanding(&self, task_id: &TaskId) -> bool {
        self.outstanding().contains_key(task_id)
    }

    /// Update the outstanding table for `event` and build what should be sent.
    pub fn notification_for(&self, event: &DomainEvent) -> Option<Notification> {
        match event {
            DomainEvent::AskPending { task_id, instance_id, kind, text, .. } => {
                let (question, suggestions) = describe_ask(*kind, text.as_deref());
                let entry = Outstanding {
                    instance_id: instance_id.clone(),
                    kind: *kind,
                    suggestions: suggestions.clone(),
                };
                if self.outstanding().insert(task_id.clone(), entry).is_some() {
                    debug!(task_id = %task_id, "Replacing outstanding notification");
                }
                let mut n = Notification::new(task_id.clone(), instance_id, NotificationKind::AskNotification);
                n.payload.question = Some(question);
                n.payload.suggestions = suggestions;
                Some(n)
            }
            DomainEvent::TaskCompleted { task_id, instance_id, result } => {
                self.outstanding().remove(task_id);
                let mut n =
                    Notification::new(task_id.clone(), instance_id, NotificationKind::CompletionNotification);
                n.payload.result = Some(result.clone());
                Some(n)
            }
            DomainEvent::TaskAborted { task_id, .. } => {
                self.outstanding().remove(task_id);
                None
            }
            _ => None,
        }
    }

    /// Route a reply to the runtime. Consumes the outstanding entry first,
    /// so each notification is answered at most once.
    pub fn handle_reply(&self, reply: &Notification) -> Resolution {
        if reply.kind != NotificationKind::ResponseFromTelegram {
            warn!(task_id = %reply.task_id, kind = ?reply.kind, "Ignoring non-reply message on the reply channel");
            return Resolution::Stale;
        }
        let entry = {
            let mut table = self.outstanding();
            match table.get(&reply.task_id) {
                Some(o) if o.instance_id == reply.instance_id => table.remove(&reply.task_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            debug!(task_id = %reply.task_id, "Reply with no outstanding notification dropped");
            return Resolution::Stale;
        };

        let text = reply.payload.result.as_deref().unwrap_or_default();
        let response = parse_reply(entry.kind, text, &entry.suggestions);
        let resolution = self.responder.respond(&reply.task_id, &reply.instance_id, response);
        info!(task_id = %reply.task_id, resolution = ?resolution, "Bridge reply routed");
        resolution
    }

    /// Forward bus events to `sink` until cancelled or the bus closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Arc<DomainEvent>>,
        sink: Arc<dyn NotificationSink>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Notification bridge fell behind the event bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(notification) = self.notification_for(&event) else {
                continue;
            };
            if let Err(e) = sink.deliver(&notification).await {
                warn!(task_id = %notification.task_id, error = %e, "Failed to deliver notification");
            }
        }
        debug!("Notification bridge stopped");
    }
}

#[async_trait]
impl ReplySink for NotificationBridge {
    async fn hand_off(&self, reply: Notification) -> Result<Resolution, ChannelError> {
        Ok(self.handle_reply(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::event::EventBus;

    #[derive(Default)]
    struct Recorder {
        responses: Mutex<Vec<(TaskId, String, AskResponse)>>,
        delivered: Mutex<Vec<Notification>>,
    }

    impl AskResponder for Recorder {
        fn respond(&self, task_id: &TaskId, instance_id: &str, response: AskResponse) -> Resolution {
            self.responses
                .lock()
                .unwrap()
                .push((task_id.clone(), instance_id.to_string(), response));
            Resolution::Accepted
        }
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
            self.delivered.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn followup(task: &str, instance: &str) -> DomainEvent {
        DomainEvent::AskPending {
            task_id: TaskId::from(task),
            instance_id: instance.into(),
            ask_ts: 1,
            kind: AskKind::Followup,
            text: Some(r#"{"question":"Which db?","suggest":["sqlite","postgres"]}"#.into()),
        }
    }

    fn bridge() -> (Arc<Recorder>, NotificationBridge) {
        let recorder = Arc::new(Recorder::default());
        let bridge = NotificationBridge::new(recorder.clone());
        (recorder, bridge)
    }

    #[test]
    fn notification_wire_format() {
        let mut n = Notification::new(TaskId::from("t1"), "i1", NotificationKind::AskNotification);
        n.payload.question = Some("Which db?".into());
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["instanceId"], "i1");
        assert_eq!(json["type"], "ask_notification");
        assert_eq!(json["payload"]["question"], "Which db?");
        assert!(json["payload"].get("suggestions").is_none());
    }

    #[test]
    fn followup_becomes_question_with_suggestions() {
        let (_, bridge) = bridge();
        let n = bridge.notification_for(&followup("t1", "i1")).unwrap();
        assert_eq!(n.kind, NotificationKind::AskNotification);
        assert_eq!(n.payload.question.as_deref(), Some("Which db?"));
        assert_eq!(n.payload.suggestions, vec!["sqlite", "postgres"]);
        assert!(bridge.is_outstanding(&TaskId::from("t1")));
    }

    #[test]
    fn reply_is_consumed_once() {
        let (recorder, bridge) = bridge();
        bridge.notification_for(&followup("t1", "i1"));

        let reply = Notification::reply(TaskId::from("t1"), "i1", "2");
        assert_eq!(bridge.handle_reply(&reply), Resolution::Accepted);
        assert_eq!(bridge.handle_reply(&reply), Resolution::Stale);

        let responses = recorder.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].2, AskResponse::message("postgres"));
    }

    #[test]
    fn reply_for_other_instance_is_dropped() {
        let (recorder, bridge) = bridge();
        bridge.notification_for(&followup("t1", "i2"));
        let reply = Notification::reply(TaskId::from("t1"), "i1", "sqlite");
        assert_eq!(bridge.handle_reply(&reply), Resolution::Stale);
        assert!(recorder.responses.lock().unwrap().is_empty());
        assert!(bridge.is_outstanding(&TaskId::from("t1")));
    }

    #[test]
    fn abort_clears_outstanding() {
        let (_, bridge) = bridge();
        bridge.notification_for(&followup("t1", "i1"));
        let aborted = DomainEvent::TaskAborted {
            task_id: TaskId::from("t1"),
            instance_id: "i1".into(),
            reason: "user".into(),
        };
        assert!(bridge.notification_for(&aborted).is_none());
        assert!(!bridge.is_outstanding(&TaskId::from("t1")));
    }

    #[test]
    fn replies_map_to_responses() {
        let none: &[String] = &[];
        assert_eq!(parse_reply(AskKind::Tool, "y", none), AskResponse::approve());
        assert_eq!(parse_reply(AskKind::Tool, "", none), AskResponse::approve());
        assert_eq!(parse_reply(AskKind::Command, "No", none), AskResponse::reject());
        assert_eq!(
            parse_reply(AskKind::CompletionResult, "add tests", none),
            AskResponse::message("add tests")
        );
        assert_eq!(parse_reply(AskKind::Followup, "yes", none), AskResponse::message("yes"));
        assert_eq!(parse_reply(AskKind::Tool, "1", &yes_no()), AskResponse::approve());
        assert_eq!(parse_reply(AskKind::Followup, "7", &yes_no()), AskResponse::message("7"));
    }

    #[test]
    fn tool_asks_name_the_tool() {
        let (question, suggestions) =
            describe_ask(AskKind::Tool, Some(r#"{"tool":"writeToFile","path":"a.rs"}"#));
        assert_eq!(question, "Allow writeToFile on a.rs?");
        assert_eq!(suggestions, yes_no());
    }

    #[tokio::test]
    async fn run_delivers_asks_and_completions() {
        let (recorder, bridge) = bridge();
        let bridge = Arc::new(bridge);
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.clone().run(bus.subscribe(), recorder.clone(), cancel.clone()));

        bus.publish(followup("t1", "i1"));
        bus.publish(DomainEvent::TaskCompleted {
            task_id: TaskId::from("t1"),
            instance_id: "i1".into(),
            result: "done".into(),
        });

        for _ in 0..100 {
            if recorder.delivered.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let delivered = recorder.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].kind, NotificationKind::CompletionNotification);
        assert_eq!(delivered[1].payload.result.as_deref(), Some("done"));
        assert!(!bridge.is_outstanding(&TaskId::from("t1")));
    }
}
