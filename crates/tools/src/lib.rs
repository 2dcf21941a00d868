//! Built-in tools.
//!
//! Each tool lives in its own module and implements
//! [`tasklane_core::tool::Tool`]. [`default_registry`] wires them all up;
//! callers that want a narrower set can register tools one by one.

pub mod ask_followup;
pub mod attempt_completion;
pub mod execute_command;
pub mod list_files;
pub mod new_task;
pub mod read_file;
pub mod workspace;
pub mod write_to_file;

use std::sync::Arc;
use tasklane_core::mode::Mode;
use tasklane_core::tool::ToolRegistry;

pub use ask_followup::AskFollowupTool;
pub use attempt_completion::AttemptCompletionTool;
pub use execute_command::ExecuteCommandTool;
pub use list_files::ListFilesTool;
pub use new_task::NewTaskTool;
pub use read_file::ReadFileTool;
pub use write_to_file::WriteToFileTool;

/// A registry holding every built-in tool. `modes` is the set `new_task` may
/// spawn into.
pub fn default_registry(modes: &[Mode]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(ListFilesTool));
    registry.register(Arc::new(WriteToFileTool));
    registry.register(Arc::new(ExecuteCommandTool));
    registry.register(Arc::new(AskFollowupTool));
    registry.register(Arc::new(AttemptCompletionTool));
    registry.register(Arc::new(NewTaskTool::new(modes)));
    registry
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tasklane_core::channel::UserChannel;
    use tasklane_core::error::AskError;
    use tasklane_core::event::EventBus;
    use tasklane_core::message::{AskKind, AskResponse, SayKind, TaskId};
    use tasklane_core::tool::ToolContext;

    /// Records says and asks; answers asks from a queue, approving when empty.
    #[derive(Default)]
    pub struct TestChannel {
        responses: Mutex<VecDeque<AskResponse>>,
        says: Mutex<Vec<(SayKind, String)>>,
        asks: Mutex<Vec<(AskKind, String)>>,
    }

    impl TestChannel {
        pub fn respond_with(&self, response: AskResponse) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn says(&self) -> Vec<(SayKind, String)> {
            self.says.lock().unwrap().clone()
        }

        pub fn asks(&self) -> Vec<(AskKind, String)> {
            self.asks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UserChannel for TestChannel {
        fn say(&self, kind: SayKind, text: &str) {
            self.says.lock().unwrap().push((kind, text.to_string()));
        }

        async fn ask(&self, kind: AskKind, text: &str) -> Result<AskResponse, AskError> {
            self.asks.lock().unwrap().push((kind, text.to_string()));
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(AskResponse::approve))
        }
    }

    pub fn context(workspace: &Path) -> (ToolContext, Arc<TestChannel>) {
        let channel = Arc::new(TestChannel::default());
        let ctx = ToolContext {
            task_id: TaskId::from("test"),
            parent_id: None,
            workspace: workspace.to_path_buf(),
            events: Arc::new(EventBus::default()),
            channel: channel.clone(),
            command_timeout: Duration::from_secs(5),
        };
        (ctx, channel)
    }
}
