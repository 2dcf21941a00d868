//! Modes: named capability sets.
//!
//! A task always runs in exactly one mode. The mode picks the role definition
//! at the top of the system prompt and the tool groups the dispatcher allows.
//! Tools with no group (`ask_followup_question`, `attempt_completion`,
//! `new_task`) are available everywhere, so a mode with no groups can still
//! ask, delegate and finish.

use serde::{Deserialize, Serialize};
use crate::tool::ToolGroup;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub slug: String,
    pub name: String,
    pub role_definition: String,
    #[serde(default)]
    pub groups: Vec<ToolGroup>,
}

impl Mode {
    pub fn new(slug: &str, name: &str, role_definition: &str, groups: &[ToolGroup]) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            role_definition: role_definition.into(),
            groups: groups.to_vec(),
        }
    }

    /// Whether a tool in `group` may run in this mode.
    pub fn allows(&self, group: Option<ToolGroup>) -> bool {
        match group {
            None => true,
            Some(g) => self.groups.contains(&g),
        }
    }

    /// The built-in modes.
    pub fn defaults() -> Vec<Mode> {
        vec![
            Mode::new(
                "code",
                "Code",
                "You are a highly skilled software engineer with extensive knowledge in many programming languages, frameworks, design patterns, and best practices.",
                &[ToolGroup::Read, ToolGroup::Edit, ToolGroup::Command],
            ),
            Mode::new(
                "architect",
                "Architect",
                "You are an experienced technical leader who is inquisitive and an excellent planner. Gather information, then produce a detailed plan before anything is implemented.",
                &[ToolGroup::Read],
            ),
            Mode::new(
                "ask",
                "Ask",
                "You are a knowledgeable technical assistant focused on answering questions about software development, technology, and related topics.",
                &[ToolGroup::Read],
            ),
            Mode::new(
                "orchestrator",
                "Orchestrator",
                "You are a strategic workflow orchestrator who coordinates complex tasks by delegating them to appropriate specialized modes using new_task.",
                &[],
            ),
        ]
    }
}

/// Find a mode by slug.
pub fn find_mode<'a>(modes: &'a [Mode], slug: &str) -> Option<&'a Mode> {
    modes.iter().find(|m| m.slug == slug)
}
