//! A task answered entirely through the file mailbox, the way a bridge in
//! another process would answer it.

use std::sync::Arc;
use std::time::Duration;
use tasklane_agent::Runtime;
use tasklane_channels::ipc::{self, FileMailbox, IpcNotifier};
use tasklane_channels::{Notification, NotificationBridge, NotificationKind};
use tasklane_config::{AppConfig, AutoApproveConfig};
use tasklane_core::message::Role;
use tasklane_providers::{ScriptStep, ScriptedProvider};
use tasklane_store::InMemoryTaskStore;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(10);

async fn next_notification(mailbox: &FileMailbox, cancel: &CancellationToken) -> Notification {
    tokio::time::timeout(
        Duration::from_secs(10),
        mailbox.next(&ipc::notify_channel("test"), POLL, cancel),
    )
    .await
    .expect("no notification arrived")
    .expect("cancelled")
}

#[tokio::test]
async fn questions_are_answered_over_the_mailbox() {
    let workspace = tempfile::tempdir().unwrap();
    let ipc_dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.auto_approve = AutoApproveConfig::all();
    config.checkpoints.enabled = false;

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::text(
            "<ask_followup_question>\n<question>Which database?</question>\n\
             <follow_up><suggest>sqlite</suggest><suggest>postgres</suggest></follow_up>\n\
             </ask_followup_question>",
        ),
        ScriptStep::text("<attempt_completion>\n<result>Using postgres</result>\n</attempt_completion>"),
    ]));
    let store = Arc::new(InMemoryTaskStore::new());
    let runtime = Arc::new(Runtime::new(config, provider.clone(), store, workspace.path()));

    let cancel = CancellationToken::new();
    let mailbox = FileMailbox::new(ipc_dir.path());
    let bridge = Arc::new(NotificationBridge::new(runtime.clone()));
    let notifier = Arc::new(IpcNotifier::new(mailbox.clone(), ipc::notify_channel("test")));
    tokio::spawn(bridge.clone().run(runtime.events().subscribe(), notifier, cancel.child_token()));
    {
        let mailbox = mailbox.clone();
        let bridge = bridge.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            ipc::forward_replies(&mailbox, &ipc::response_channel("test"), bridge.as_ref(), POLL, &cancel).await;
        });
    }

    let run = runtime.start_task("set up storage", Vec::new(), None).unwrap();
    let task_id = run.task_id.clone();

    let ask = next_notification(&mailbox, &cancel).await;
    assert_eq!(ask.kind, NotificationKind::AskNotification);
    assert_eq!(ask.task_id, task_id);
    assert_eq!(ask.payload.question.as_deref(), Some("Which database?"));
    assert_eq!(ask.payload.suggestions, vec!["sqlite", "postgres"]);
    let reply = Notification::reply(task_id.clone(), ask.instance_id.clone(), "2");
    mailbox.send(&ipc::response_channel("test"), &reply).await.unwrap();

    let completion_ask = next_notification(&mailbox, &cancel).await;
    assert_eq!(completion_ask.kind, NotificationKind::AskNotification);
    let reply = Notification::reply(task_id.clone(), completion_ask.instance_id.clone(), "yes");
    mailbox.send(&ipc::response_channel("test"), &reply).await.unwrap();

    let done = next_notification(&mailbox, &cancel).await;
    assert_eq!(done.kind, NotificationKind::CompletionNotification);
    assert_eq!(done.payload.result.as_deref(), Some("Using postgres"));

    assert!(run.wait().await.is_completed());
    assert!(!bridge.is_outstanding(&task_id));

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    let answer = requests[1]
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .unwrap()
        .text();
    assert!(answer.contains("postgres"));
    cancel.cancel();
}
