//! Telegram transport for the notification bridge.
//!
//! Chats link themselves to tasks with `/register <task_id>`. Each chat has
//! at most one pending question; the next plain-text message from that chat
//! is its answer. Registrations survive restarts in a JSON file.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasklane_config::BridgeConfig;
use tasklane_core::channel::Resolution;
use tasklane_core::error::ChannelError;
use tasklane_core::message::TaskId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{Notification, NotificationKind, NotificationSink, ReplySink};

const POLL_TIMEOUT_SECS: u64 = 30;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// An incoming update from `getUpdates`.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// The two Bot API calls the bridge needs.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ChannelError>;
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError>;
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API over HTTPS.
pub struct HttpBotApi {
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpBotApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBotApi").field("token", &"[REDACTED]").finish()
    }
}

impl HttpBotApi {
    pub fn new(token: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: format!("https://api.telegram.org/bot{token}"),
            client,
        }
    }

    fn failed(e: impl std::fmt::Display) -> ChannelError {
        ChannelError::DeliveryFailed {
            channel: "telegram".into(),
            reason: e.to_string(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ChannelError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::failed)?;
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChannelError::Unauthorized {
                channel: "telegram".into(),
                sender_id: body.get("chat_id").map(|c| c.to_string()).unwrap_or_default(),
            });
        }
        let parsed: ApiResponse<T> = response.json().await.map_err(Self::failed)?;
        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(Self::failed(
                parsed.description.unwrap_or_else(|| format!("{method} failed ({status})")),
            )),
        }
    }
}

#[async_trait]
impl BotApi for HttpBotApi {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ChannelError> {
        self.call(
            "getUpdates",
            serde_json::json!({ "offset": offset, "timeout": timeout_secs, "allowed_updates": ["message"] }),
        )
        .await
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        self.call::<serde_json::Value>("sendMessage", serde_json::json!({ "chat_id": chat_id, "text": text }))
            .await
            .map(|_| ())
    }
}

/// Task → chat links, persisted as a JSON object.
#[derive(Debug)]
pub struct Registrations {
    path: PathBuf,
    tasks: BTreeMap<String, i64>,
}

impl Registrations {
    /// Load from `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tasks = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, i64>>(&raw) {
                Ok(tasks) => {
                    info!(count = tasks.len(), path = %path.display(), "Loaded registrations");
                    tasks
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Registrations file is invalid, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read registrations, starting empty");
                BTreeMap::new()
            }
        };
        Self { path, tasks }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) {
        let result = self
            .path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| {
                let json = serde_json::to_string_pretty(&self.tasks).map_err(std::io::Error::other)?;
                std::fs::write(&self.path, json)
            });
        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "Failed to save registrations");
        }
    }

    pub fn register(&mut self, task_id: &str, chat_id: i64) {
        self.tasks.insert(task_id.to_string(), chat_id);
        info!(task_id, chat_id, "Registered task");
        self.save();
    }

    pub fn unregister(&mut self, task_id: &str) -> Option<i64> {
        let chat = self.tasks.remove(task_id)?;
        info!(task_id, chat_id = chat, "Unregistered task");
        self.save();
        Some(chat)
    }

    pub fn chat_for(&self, task_id: &str) -> Option<i64> {
        self.tasks.get(task_id).copied()
    }

    pub fn tasks_for(&self, chat_id: i64) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, c)| **c == chat_id)
            .map(|(t, _)| t.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
struct PendingQuestion {
    task_id: TaskId,
    instance_id: String,
}

/// Format a question the way it is shown in the chat.
pub fn format_question(task_id: &TaskId, question: &str, suggestions: &[String]) -> String {
    let mut text = format!("Task ({}...):\n\n{question}", task_id.short());
    if !suggestions.is_empty() {
        text.push_str("\n\nSuggestions:");
        for (i, s) in suggestions.iter().enumerate() {
            text.push_str(&format!("\n{}. {s}", i + 1));
        }
    }
    text.push_str("\n\nPlease reply with your answer.");
    text
}

const WELCOME: &str = "Welcome to the tasklane bridge!\n\
Use /register <task_id> to link this chat to a task.\n\
Use /unregister <task_id> to remove the link.\n\
Task IDs are printed when a task starts and listed by `tasklane history`.";

pub struct TelegramBridge {
    api: Arc<dyn BotApi>,
    registrations: Mutex<Registrations>,
    pending: Mutex<HashMap<i64, PendingQuestion>>,
    /// Empty = deny all, `["*"]` = allow all.
    allowed_chats: Vec<String>,
    replies: Arc<dyn ReplySink>,
}

impl TelegramBridge {
    pub fn new(
        api: Arc<dyn BotApi>,
        registrations: Registrations,
        allowed_chats: Vec<String>,
        replies: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            api,
            registrations: Mutex::new(registrations),
            pending: Mutex::new(HashMap::new()),
            allowed_chats,
            replies,
        }
    }

    pub fn from_config(config: &BridgeConfig, replies: Arc<dyn ReplySink>) -> Result<Self, ChannelError> {
        let token = config
            .telegram_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChannelError::NotConfigured("bridge.telegram_token is not set".into()))?;
        Ok(Self::new(
            Arc::new(HttpBotApi::new(token)),
            Registrations::load(config.registration_file()),
            config.allowed_chats.clone(),
            replies,
        ))
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, Registrations> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingQuestion>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_allowed(&self, chat_id: i64) -> bool {
        let id = chat_id.to_string();
        self.allowed_chats.iter().any(|c| c == "*" || *c == id)
    }

    pub fn has_pending(&self, chat_id: i64) -> bool {
        self.pending().contains_key(&chat_id)
    }

    /// Send a message. A chat that blocked the bot loses its registrations.
    async fn send(&self, chat_id: i64, text: &str) -> bool {
        match self.api.send_message(chat_id, text).await {
            Ok(()) => {
                debug!(chat_id, "Telegram message sent");
                true
            }
            Err(ChannelError::Unauthorized { .. }) => {
                warn!(chat_id, "Bot blocked by chat, dropping its registrations");
                let mut regs = self.registrations();
                for task in regs.tasks_for(chat_id) {
                    regs.unregister(&task);
                }
                drop(regs);
                self.pending().remove(&chat_id);
                false
            }
            Err(e) => {
                error!(chat_id, error = %e, "Failed to send Telegram message");
                false
            }
        }
    }

    pub async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else { return };
        let Some(text) = message.text else { return };
        let chat_id = message.chat.id;

        if !self.is_allowed(chat_id) {
            warn!(chat_id, "Message from chat outside the allowlist");
            self.send(chat_id, "This chat is not allowed to use this bridge.").await;
            return;
        }

        let text = text.trim();
        if let Some(command) = text.strip_prefix('/') {
            let mut parts = command.split_whitespace();
            // Commands may be addressed as /register@botname
            let name = parts.next().unwrap_or_default().split('@').next().unwrap_or_default();
            let arg = parts.next();
            self.handle_command(chat_id, name, arg).await;
        } else {
            self.handle_reply(chat_id, text).await;
        }
    }

    async fn handle_command(&self, chat_id: i64, name: &str, arg: Option<&str>) {
        let reply = match (name, arg) {
            ("start", _) => WELCOME.to_string(),
            ("register", None) => "Please provide the task ID.\nUsage: /register <task_id>".to_string(),
            ("register", Some(task_id)) => {
                self.registrations().register(task_id, chat_id);
                format!("Task '{task_id}' is now linked to this chat. You will receive its questions here.")
            }
            ("unregister", None) => {
                "Please provide the task ID to unregister.\nUsage: /unregister <task_id>".to_string()
            }
            ("unregister", Some(task_id)) => {
                let mut regs = self.registrations();
                if regs.chat_for(task_id) != Some(chat_id) {
                    format!("Task '{task_id}' is not linked to this chat.")
                } else {
                    regs.unregister(task_id);
                    drop(regs);
                    let mut pending = self.pending();
                    if pending.get(&chat_id).is_some_and(|p| p.task_id.0 == task_id) {
                        pending.remove(&chat_id);
                    }
                    format!("Task '{task_id}' has been unlinked from this chat.")
                }
            }
            _ => format!("Unknown command /{name}. Try /start."),
        };
        self.send(chat_id, &reply).await;
    }

    async fn handle_reply(&self, chat_id: i64, text: &str) {
        let Some(question) = self.pending().remove(&chat_id) else {
            info!(chat_id, "Message received but no question was pending");
            self.send(
                chat_id,
                "I wasn't waiting for a response from you right now. Use /register <task_id> to link a task.",
            )
            .await;
            return;
        };

        let reply = Notification::reply(question.task_id.clone(), &question.instance_id, text);
        match self.replies.hand_off(reply).await {
            Ok(Resolution::Accepted) => {
                info!(chat_id, task_id = %question.task_id, "Reply handed off");
                self.send(chat_id, "Your response has been sent to the task.").await;
            }
            Ok(Resolution::Stale) => {
                self.send(chat_id, "That question was already answered or is no longer waiting.")
                    .await;
            }
            Err(e) => {
                error!(chat_id, task_id = %question.task_id, error = %e, "Failed to hand off reply");
                let short = question.task_id.short().to_string();
                // A question that arrived meanwhile takes precedence
                self.pending().entry(chat_id).or_insert(question);
                self.send(
                    chat_id,
                    &format!("Error: could not deliver your response for task '{short}...'. Please try again."),
                )
                .await;
            }
        }
    }

    /// Long-poll for updates until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Telegram bridge polling");
        let mut offset = 0;
        loop {
            let updates = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                updates = self.api.get_updates(offset, POLL_TIMEOUT_SECS) => updates,
            };
            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("Telegram bridge stopped");
    }
}

#[async_trait]
impl NotificationSink for TelegramBridge {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        let task_id = &notification.task_id;
        let Some(chat_id) = self.registrations().chat_for(&task_id.0) else {
            warn!(task_id = %task_id, "Notification for unregistered task ignored");
            return Ok(());
        };

        let text = match notification.kind {
            NotificationKind::AskNotification => {
                let question = PendingQuestion {
                    task_id: task_id.clone(),
                    instance_id: notification.instance_id.clone(),
                };
                if self.pending().insert(chat_id, question).is_some() {
                    warn!(chat_id, task_id = %task_id, "New question replaces an unanswered one");
                }
                format_question(
                    task_id,
                    notification.payload.question.as_deref().unwrap_or_default(),
                    &notification.payload.suggestions,
                )
            }
            NotificationKind::CompletionNotification => {
                let mut pending = self.pending();
                if pending.get(&chat_id).is_some_and(|p| &p.task_id == task_id) {
                    pending.remove(&chat_id);
                }
                format!(
                    "Task ({}...) completed:\n\n{}",
                    task_id.short(),
                    notification.payload.result.as_deref().unwrap_or_default()
                )
            }
            NotificationKind::ResponseFromTelegram => {
                debug!(task_id = %task_id, "Ignoring reply on the notification side");
                return Ok(());
            }
        };

        if self.send(chat_id, &text).await {
            Ok(())
        } else {
            Err(ChannelError::DeliveryFailed {
                channel: "telegram".into(),
                reason: format!("could not message chat {chat_id}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeApi {
        sent: Mutex<Vec<(i64, String)>>,
        blocked: Mutex<Vec<i64>>,
    }

    impl FakeApi {
        fn last(&self) -> (i64, String) {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl BotApi for FakeApi {
        async fn get_updates(&self, _offset: i64, _timeout: u64) -> Result<Vec<Update>, ChannelError> {
            Ok(Vec::new())
        }

        async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
            if self.blocked.lock().unwrap().contains(&chat_id) {
                return Err(ChannelError::Unauthorized {
                    channel: "telegram".into(),
                    sender_id: chat_id.to_string(),
                });
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReplies {
        replies: Mutex<Vec<Notification>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ReplySink for FakeReplies {
        async fn hand_off(&self, reply: Notification) -> Result<Resolution, ChannelError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ChannelError::LockTimeout("x_response".into()));
            }
            self.replies.lock().unwrap().push(reply);
            Ok(Resolution::Accepted)
        }
    }

    struct Fixture {
        api: Arc<FakeApi>,
        replies: Arc<FakeReplies>,
        bridge: TelegramBridge,
        dir: tempfile::TempDir,
    }

    fn fixture(allowed: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let replies = Arc::new(FakeReplies::default());
        let bridge = TelegramBridge::new(
            api.clone(),
            Registrations::load(dir.path().join("registrations.json")),
            allowed.iter().map(|s| s.to_string()).collect(),
            replies.clone(),
        );
        Fixture { api, replies, bridge, dir }
    }

    fn text(chat: i64, text: &str) -> Update {
        Update {
            update_id: 1,
            message: Some(IncomingMessage {
                chat: Chat { id: chat },
                text: Some(text.into()),
            }),
        }
    }

    fn ask(task: &str) -> Notification {
        let mut n = Notification::new(TaskId::from(task), "inst", NotificationKind::AskNotification);
        n.payload.question = Some("Which db?".into());
        n.payload.suggestions = vec!["sqlite".into(), "postgres".into()];
        n
    }

    #[test]
    fn question_lists_numbered_suggestions() {
        let text = format_question(
            &TaskId::from("0123456789"),
            "Which db?",
            &["sqlite".to_string(), "postgres".to_string()],
        );
        assert!(text.starts_with("Task (01234567...):\n\nWhich db?"));
        assert!(text.contains("Suggestions:\n1. sqlite\n2. postgres"));
        assert!(text.ends_with("Please reply with your answer."));
    }

    #[test]
    fn registrations_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registrations.json");
        let mut regs = Registrations::load(&path);
        regs.register("task-a", 42);
        regs.register("task-b", 7);
        assert_eq!(regs.unregister("task-b"), Some(7));

        let reloaded = Registrations::load(&path);
        assert_eq!(reloaded.chat_for("task-a"), Some(42));
        assert_eq!(reloaded.chat_for("task-b"), None);
    }

    #[test]
    fn invalid_registrations_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registrations.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(Registrations::load(&path).tasks_for(1).is_empty());
    }

    #[tokio::test]
    async fn register_then_answer_question() {
        let f = fixture(&["*"]);
        f.bridge.handle_update(text(42, "/register t1")).await;
        assert!(f.api.last().1.contains("'t1' is now linked"));

        f.bridge.deliver(&ask("t1")).await.unwrap();
        assert_eq!(f.api.last().0, 42);
        assert!(f.api.last().1.contains("1. sqlite"));
        assert!(f.bridge.has_pending(42));

        f.bridge.handle_update(text(42, "2")).await;
        assert!(!f.bridge.has_pending(42));
        let replies = f.replies.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].task_id, TaskId::from("t1"));
        assert_eq!(replies[0].instance_id, "inst");
        assert_eq!(replies[0].payload.result.as_deref(), Some("2"));
        assert!(f.api.last().1.contains("has been sent"));
        assert!(f.dir.path().join("registrations.json").exists());
    }

    #[tokio::test]
    async fn unsolicited_text_is_not_forwarded() {
        let f = fixture(&["*"]);
        f.bridge.handle_update(text(42, "hello")).await;
        assert!(f.replies.replies.lock().unwrap().is_empty());
        assert!(f.api.last().1.contains("wasn't waiting"));
    }

    #[tokio::test]
    async fn failed_hand_off_restores_question() {
        let f = fixture(&["*"]);
        f.bridge.handle_update(text(42, "/register t1")).await;
        f.bridge.deliver(&ask("t1")).await.unwrap();
        f.replies.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        f.bridge.handle_update(text(42, "sqlite")).await;
        assert!(f.bridge.has_pending(42));
        assert!(f.api.last().1.starts_with("Error: could not deliver"));
    }

    #[tokio::test]
    async fn unregister_only_from_owning_chat() {
        let f = fixture(&["*"]);
        f.bridge.handle_update(text(42, "/register t1")).await;
        f.bridge.handle_update(text(7, "/unregister t1")).await;
        assert!(f.api.last().1.contains("not linked to this chat"));

        f.bridge.handle_update(text(42, "/unregister@tasklane_bot t1")).await;
        assert!(f.api.last().1.contains("unlinked"));
        f.bridge.deliver(&ask("t1")).await.unwrap();
        assert!(!f.bridge.has_pending(42));
    }

    #[tokio::test]
    async fn allowlist_is_enforced() {
        let f = fixture(&["42"]);
        f.bridge.handle_update(text(7, "/register t1")).await;
        assert_eq!(f.api.last(), (7, "This chat is not allowed to use this bridge.".to_string()));
        assert!(f.bridge.registrations().chat_for("t1").is_none());

        let closed = fixture(&[]);
        assert!(!closed.bridge.is_allowed(42));
    }

    #[tokio::test]
    async fn blocked_chat_loses_registrations() {
        let f = fixture(&["*"]);
        f.bridge.handle_update(text(42, "/register t1")).await;
        f.api.blocked.lock().unwrap().push(42);

        assert!(f.bridge.deliver(&ask("t1")).await.is_err());
        assert!(f.bridge.registrations().chat_for("t1").is_none());
        assert!(!f.bridge.has_pending(42));
    }

    #[tokio::test]
    async fn completion_clears_pending_question() {
        let f = fixture(&["*"]);
        f.bridge.handle_update(text(42, "/register t1")).await;
        f.bridge.deliver(&ask("t1")).await.unwrap();

        let mut done = Notification::new(TaskId::from("t1"), "inst", NotificationKind::CompletionNotification);
        done.payload.result = Some("shipped".into());
        f.bridge.deliver(&done).await.unwrap();
        assert!(!f.bridge.has_pending(42));
        assert!(f.api.last().1.ends_with("shipped"));
    }
}
