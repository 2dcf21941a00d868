//! `tasklane bridge`: relay questions between the IPC mailbox and Telegram.
//!
//! Runs next to any number of `tasklane run` processes configured with
//! `bridge.transport = "ipc"`.

use std::sync::Arc;
use std::time::Duration;
use tasklane_channels::ipc::{self, FileMailbox, IpcReplies};
use tasklane_channels::TelegramBridge;
use tasklane_config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

const NOTIFY_POLL: Duration = Duration::from_secs(1);

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let bridge = &config.bridge;

    let mailbox = FileMailbox::new(bridge.ipc_dir());
    let replies = Arc::new(IpcReplies::new(mailbox.clone(), ipc::response_channel(&bridge.ipc_prefix)));
    let telegram = Arc::new(TelegramBridge::from_config(bridge, replies)?);

    let cancel = CancellationToken::new();
    let poller = tokio::spawn(telegram.clone().run(cancel.child_token()));

    let notify = ipc::notify_channel(&bridge.ipc_prefix);
    info!(dir = %mailbox.base_dir().display(), channel = %notify, "Bridge relaying");
    println!("Bridge running. Press Ctrl-C to stop.");

    tokio::select! {
        _ = ipc::forward_notifications(&mailbox, &notify, telegram.as_ref(), NOTIFY_POLL, &cancel) => {}
        _ = tokio::signal::ctrl_c() => info!("Stopping bridge"),
    }
    cancel.cancel();
    poller.await?;
    Ok(())
}
