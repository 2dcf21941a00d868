//! The task runtime: the heart of tasklane.
//!
//! A task follows a **request → stream → present → dispatch** cycle:
//!
//! 1. **Request**: the queued user content (task text, tool results) is
//!    appended to the history, the history is truncated to the model's
//!    budget, and a streaming request is opened
//! 2. **Stream**: every chunk is appended to a buffer and re-parsed into
//!    content blocks
//! 3. **Present**: blocks are handled strictly in order; text is said,
//!    tool calls go to the dispatcher
//! 4. **Dispatch**: at most one tool runs per turn, behind an approval ask,
//!    with checkpoints around mutating tools
//!
//! The loop repeats until a completion is accepted or the task is aborted.
//! `new_task` pauses the current task while a child task runs.

pub mod checkpoint;
pub mod dispatcher;
pub mod loop_runner;
pub mod messenger;
pub mod parser;
pub mod prompt;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod truncate;

pub use checkpoint::{
    ChangeKind, Checkpoint, CheckpointManager, FileChange, RestoreMode, ShadowStore, SnapshotBackend,
};
pub use dispatcher::{DispatchEnv, Dispatcher, TurnState};
pub use messenger::Messenger;
pub use parser::{ContentBlock, StreamParser, ToolUse};
pub use scheduler::Runtime;
pub use task::{ChildOutcome, TaskHandle, TaskOutcome, TaskRun};
