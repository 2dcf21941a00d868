//! File-based mailbox for talking to a bridge running in another process.
//!
//! Each named channel is a single message file under the base directory,
//! guarded by a lock file created exclusively. A newer message overwrites an
//! unread one. Messages are wrapped in a `{timestamp, payload}` envelope.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tasklane_core::channel::Resolution;
use tasklane_core::error::ChannelError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{Notification, NotificationSink, ReplySink};

const LOCK_RETRY: Duration = Duration::from_millis(100);
/// A lock file older than this was left by a crashed writer.
const STALE_LOCK: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    /// Seconds since the Unix epoch.
    timestamp: f64,
    payload: T,
}

#[derive(Debug, Clone)]
pub struct FileMailbox {
    base_dir: PathBuf,
    lock_timeout: Duration,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FileMailbox {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn lock_path(&self, channel: &str) -> PathBuf {
        self.base_dir.join(format!("{channel}.lock"))
    }

    fn message_path(&self, channel: &str) -> PathBuf {
        self.base_dir.join(format!("{channel}_message.json"))
    }

    fn io_error(channel: &str, e: impl std::fmt::Display) -> ChannelError {
        ChannelError::DeliveryFailed {
            channel: channel.to_string(),
            reason: e.to_string(),
        }
    }

    async fn lock(&self, channel: &str) -> Result<LockGuard, ChannelError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| Self::io_error(channel, e))?;

        let path = self.lock_path(channel);
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await {
                        warn!(channel, "Removing stale IPC lock");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                }
                Err(e) => return Err(Self::io_error(channel, e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChannelError::LockTimeout(channel.to_string()));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    /// Write `payload` as the channel's message, replacing any unread one.
    pub async fn send<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), ChannelError> {
        let envelope = Envelope {
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            payload,
        };
        let json = serde_json::to_vec(&envelope).map_err(|e| ChannelError::InvalidPayload(e.to_string()))?;

        let _guard = self.lock(channel).await?;
        let path = self.message_path(channel);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Self::io_error(channel, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(channel, e))?;
        debug!(channel, "IPC message written");
        Ok(())
    }

    /// Read the channel's message, if any. A malformed message is removed
    /// when `remove_after_read` is set so it cannot wedge the channel.
    pub async fn receive<T: DeserializeOwned>(
        &self,
        channel: &str,
        remove_after_read: bool,
    ) -> Result<Option<T>, ChannelError> {
        let _guard = self.lock(channel).await?;
        let path = self.message_path(channel);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(channel, e)),
        };
        if remove_after_read {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| Self::io_error(channel, e))?;
        }
        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|e| ChannelError::InvalidPayload(e.to_string()))?;
        Ok(Some(envelope.payload))
    }

    /// Poll `channel` every `interval` until a message arrives. Returns
    /// `None` once `cancel` fires. Read errors are logged and skipped.
    pub async fn next<T: DeserializeOwned>(
        &self,
        channel: &str,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Option<T> {
        loop {
            match self.receive(channel, true).await {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(e) => warn!(channel, error = %e, "Failed to read IPC channel"),
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_LOCK)
}

/// Sends notifications into a mailbox channel.
pub struct IpcNotifier {
    mailbox: FileMailbox,
    channel: String,
}

impl IpcNotifier {
    pub fn new(mailbox: FileMailbox, channel: impl Into<String>) -> Self {
        Self {
            mailbox,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for IpcNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.mailbox.send(&self.channel, notification).await
    }
}

/// Hands replies off into a mailbox channel. The other side decides whether
/// anything was waiting, so a written reply counts as accepted.
pub struct IpcReplies {
    mailbox: FileMailbox,
    channel: String,
}

impl IpcReplies {
    pub fn new(mailbox: FileMailbox, channel: impl Into<String>) -> Self {
        Self {
            mailbox,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ReplySink for IpcReplies {
    async fn hand_off(&self, reply: Notification) -> Result<Resolution, ChannelError> {
        self.mailbox.send(&self.channel, &reply).await?;
        Ok(Resolution::Accepted)
    }
}

/// Channel names derived from the configured prefix.
pub fn notify_channel(prefix: &str) -> String {
    format!("{prefix}_notify")
}

pub fn response_channel(prefix: &str) -> String {
    format!("{prefix}_response")
}

/// Drain `channel` into `sink` until cancelled.
pub async fn forward_notifications(
    mailbox: &FileMailbox,
    channel: &str,
    sink: &dyn NotificationSink,
    interval: Duration,
    cancel: &CancellationToken,
) {
    while let Some(notification) = mailbox.next::<Notification>(channel, interval, cancel).await {
        if let Err(e) = sink.deliver(&notification).await {
            warn!(task_id = %notification.task_id, error = %e, "Failed to forward notification");
        }
    }
}

/// Drain `channel` into `replies` until cancelled.
pub async fn forward_replies(
    mailbox: &FileMailbox,
    channel: &str,
    replies: &dyn ReplySink,
    interval: Duration,
    cancel: &CancellationToken,
) {
    while let Some(reply) = mailbox.next::<Notification>(channel, interval, cancel).await {
        match replies.hand_off(reply).await {
            Ok(resolution) => debug!(resolution = ?resolution, "Reply forwarded"),
            Err(e) => warn!(error = %e, "Failed to forward reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NotificationKind;
    use serde_json::json;
    use tasklane_core::message::TaskId;

    #[tokio::test]
    async fn send_then_receive_removes_message() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::new(dir.path());

        mailbox.send("proj_notify", &json!({"step": "build"})).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("proj_notify_message.json")).unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(envelope["timestamp"].as_f64().unwrap() > 0.0);
        assert_eq!(envelope["payload"]["step"], "build");

        let got: Option<serde_json::Value> = mailbox.receive("proj_notify", true).await.unwrap();
        assert_eq!(got.unwrap()["step"], "build");
        let again: Option<serde_json::Value> = mailbox.receive("proj_notify", true).await.unwrap();
        assert!(again.is_none());
        assert!(!dir.path().join("proj_notify.lock").exists());
    }

    #[tokio::test]
    async fn receive_can_keep_message() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::new(dir.path());
        mailbox.send("c", &"hello").await.unwrap();

        let first: Option<String> = mailbox.receive("c", false).await.unwrap();
        let second: Option<String> = mailbox.receive("c", false).await.unwrap();
        assert_eq!(first.as_deref(), Some("hello"));
        assert_eq!(second.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::new(dir.path()).with_lock_timeout(Duration::from_millis(250));
        std::fs::write(dir.path().join("busy.lock"), "").unwrap();

        let err = mailbox.send("busy", &"x").await.unwrap_err();
        assert!(matches!(err, ChannelError::LockTimeout(ref c) if c == "busy"));
    }

    #[tokio::test]
    async fn malformed_message_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::new(dir.path());
        std::fs::write(dir.path().join("c_message.json"), "not json").unwrap();

        let err = mailbox.receive::<String>("c", true).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidPayload(_)));
        assert!(mailbox.receive::<String>("c", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_waits_for_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::new(dir.path());
        let cancel = CancellationToken::new();

        let writer = mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let reply = Notification::reply(TaskId::from("t1"), "i1", "yes");
            writer.send(&response_channel("proj"), &reply).await.unwrap();
        });

        let got: Notification = mailbox
            .next(&response_channel("proj"), Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert_eq!(got.kind, NotificationKind::ResponseFromTelegram);
        assert_eq!(got.payload.result.as_deref(), Some("yes"));

        cancel.cancel();
        let none: Option<Notification> = mailbox.next("empty", Duration::from_millis(10), &cancel).await;
        assert!(none.is_none());
    }
}
