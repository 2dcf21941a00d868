//! Out-of-process channels for answering a task's questions.
//!
//! - [`NotificationBridge`]: turns pending asks into notifications and routes
//!   replies back to the runtime, at most once per question
//! - [`TelegramBridge`]: delivers notifications to linked Telegram chats
//! - [`FileMailbox`]: lock-file guarded message files for bridges running in
//!   another process
//! - [`TerminalResponder`]: answers asks from stdin

pub mod bridge;
pub mod cli;
pub mod ipc;
pub mod telegram;

pub use bridge::{
    describe_ask, parse_reply, Notification, NotificationBridge, NotificationKind, NotificationPayload,
    NotificationSink, ReplySink,
};
pub use cli::TerminalResponder;
pub use ipc::{FileMailbox, IpcNotifier, IpcReplies};
pub use telegram::{BotApi, HttpBotApi, Registrations, TelegramBridge};
