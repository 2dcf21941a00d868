//! # tasklane Core
//!
//! Domain types, traits, and error definitions for the tasklane task runtime.
//! This crate has no framework dependencies: it defines the vocabulary that
//! the agent loop, the tools, the model clients and the notification bridge
//! all implement against.
//!
//! ## Layout
//!
//! - [`message`]: model-facing history and the UI-facing ask/say log
//! - [`provider`]: the streaming model client contract
//! - [`tool`]: the tool capability interface and registry
//! - [`mode`]: modes and the tool groups they enable
//! - [`channel`]: the ask/say surface tools use to talk to the human
//! - [`store`]: task persistence contract
//! - [`event`]: domain events broadcast to observers (UI, bridge)

pub mod error;
pub mod message;
pub mod provider;
pub mod channel;
pub mod tool;
pub mod mode;
pub mod store;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{
    ApiMessage, AskKind, AskResponse, ContentPart, MessageKind, ResponseKind, Role, SayKind,
    TaskId, TokenAccounting, UiMessage,
};
pub use provider::{ModelInfo, ModelRequest, Provider, StreamChunk, Usage};
pub use channel::{AskResponder, Resolution, UserChannel};
pub use tool::{
    ApprovalRequest, Tool, ToolContext, ToolEffect, ToolGroup, ToolOutput, ToolParam, ToolParams,
    ToolRegistry,
};
pub use mode::Mode;
pub use store::{HistoryItem, TaskSnapshot, TaskStore};
pub use event::{DomainEvent, EventBus};
