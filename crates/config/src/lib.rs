//! Configuration loading, validation, and management for tasklane.
//!
//! Loads configuration from `~/.tasklane/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tasklane_core::tool::ToolGroup;
use tasklane_core::Mode;

/// The root configuration structure.
///
/// Maps directly to `~/.tasklane/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Max tokens per model response; also reserved out of the context window
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Context window of the default model, in tokens
    #[serde(default = "default_context_window")]
    pub context_window: u64,

    /// Mode new tasks start in
    #[serde(default = "default_mode")]
    pub default_mode: String,

    /// Extra instructions appended to every system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,

    /// Task loop behaviour
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Tool groups that run without asking
    #[serde(default)]
    pub auto_approve: AutoApproveConfig,

    /// Workspace snapshots
    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    /// Task persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote notification bridge
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Custom modes, added to (or replacing) the built-in ones by slug
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<Mode>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.0
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_context_window() -> u64 {
    200_000
}
fn default_mode() -> String {
    "code".into()
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("context_window", &self.context_window)
            .field("default_mode", &self.default_mode)
            .field("runtime", &self.runtime)
            .field("auto_approve", &self.auto_approve)
            .field("checkpoints", &self.checkpoints)
            .field("storage", &self.storage)
            .field("bridge", &self.bridge)
            .field("providers", &self.providers)
            .field("modes", &self.modes)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Retry failed first chunks without asking
    #[serde(default = "default_true")]
    pub auto_retry: bool,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// Maximum auto-retries before falling back to asking
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_first_chunk_timeout")]
    pub first_chunk_timeout_secs: u64,

    /// Minimum spacing between model requests (0 = none)
    #[serde(default)]
    pub rate_limit_secs: u64,

    /// Consecutive mistakes before the loop asks whether to continue
    #[serde(default = "default_mistake_limit")]
    pub mistake_limit: u32,

    #[serde(default = "default_subtask_poll_interval")]
    pub subtask_poll_interval_ms: u64,

    /// Upper bound on how long a parent waits for a child
    #[serde(default = "default_subtask_timeout")]
    pub subtask_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_retry_base_delay() -> u64 {
    5
}
fn default_max_retry_delay() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    5
}
fn default_first_chunk_timeout() -> u64 {
    300
}
fn default_mistake_limit() -> u32 {
    3
}
fn default_subtask_poll_interval() -> u64 {
    1000
}
fn default_subtask_timeout() -> u64 {
    3600
}
fn default_command_timeout() -> u64 {
    120
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            retry_base_delay_secs: default_retry_base_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            max_retries: default_max_retries(),
            first_chunk_timeout_secs: default_first_chunk_timeout(),
            rate_limit_secs: 0,
            mistake_limit: default_mistake_limit(),
            subtask_poll_interval_ms: default_subtask_poll_interval(),
            subtask_timeout_secs: default_subtask_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoApproveConfig {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub edit: bool,
    #[serde(default)]
    pub command: bool,
    /// Approve `new_task` delegation without asking
    #[serde(default)]
    pub subtasks: bool,
}

impl AutoApproveConfig {
    /// Everything auto-approved (`--auto-approve`).
    pub fn all() -> Self {
        Self { read: true, edit: true, command: true, subtasks: true }
    }

    /// Whether a tool in `group` skips the approval ask.
    pub fn covers(&self, group: Option<ToolGroup>) -> bool {
        match group {
            Some(ToolGroup::Read) => self.read,
            Some(ToolGroup::Edit) => self.edit,
            Some(ToolGroup::Command) => self.command,
            // Only new_task asks among the ungrouped tools
            None => self.subtasks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_init_timeout")]
    pub init_timeout_secs: u64,

    /// Where snapshots live. Must be outside the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,

    /// Directory names never snapshotted or restored
    #[serde(default = "default_checkpoint_exclude")]
    pub exclude: Vec<String>,
}

fn default_checkpoint_init_timeout() -> u64 {
    15
}
fn default_checkpoint_exclude() -> Vec<String> {
    vec![".git".into(), "node_modules".into(), "target".into()]
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_timeout_secs: default_checkpoint_init_timeout(),
            store_dir: None,
            exclude: default_checkpoint_exclude(),
        }
    }
}

impl CheckpointConfig {
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("checkpoints"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn tasks_dir(&self) -> PathBuf {
        self.tasks_dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("tasks"))
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "telegram" or "ipc"
    #[serde(default = "default_bridge_transport")]
    pub transport: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_token: Option<String>,

    /// Chat IDs allowed to register. Empty = deny all. ["*"] = allow all.
    #[serde(default)]
    pub allowed_chats: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_dir: Option<PathBuf>,

    /// Prefix of the IPC channel names (`<prefix>_notify`, `<prefix>_response`)
    #[serde(default = "default_ipc_prefix")]
    pub ipc_prefix: String,
}

fn default_bridge_transport() -> String {
    "ipc".into()
}
fn default_ipc_prefix() -> String {
    "tasklane".into()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: default_bridge_transport(),
            telegram_token: None,
            allowed_chats: Vec::new(),
            registration_file: None,
            ipc_dir: None,
            ipc_prefix: default_ipc_prefix(),
        }
    }
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("enabled", &self.enabled)
            .field("transport", &self.transport)
            .field("telegram_token", &redact(&self.telegram_token))
            .field("allowed_chats", &self.allowed_chats)
            .field("registration_file", &self.registration_file)
            .field("ipc_dir", &self.ipc_dir)
            .field("ipc_prefix", &self.ipc_prefix)
            .finish()
    }
}

impl BridgeConfig {
    pub fn ipc_dir(&self) -> PathBuf {
        self.ipc_dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("ipc"))
    }

    pub fn registration_file(&self) -> PathBuf {
        self.registration_file
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("registrations.json"))
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.tasklane/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `TASKLANE_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("TASKLANE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("TASKLANE_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("TASKLANE_MODEL") {
            self.default_model = model;
        }

        if self.bridge.telegram_token.is_none() {
            self.bridge.telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tasklane")
    }

    /// The workspace tasks operate on: `TASKLANE_WORKSPACE` or the current dir.
    pub fn workspace_dir() -> PathBuf {
        std::env::var("TASKLANE_WORKSPACE")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if u64::from(self.default_max_tokens) >= self.context_window {
            return Err(ConfigError::ValidationError(
                "default_max_tokens must be smaller than context_window".into(),
            ));
        }

        if self.runtime.mistake_limit == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.mistake_limit must be at least 1".into(),
            ));
        }

        if self.runtime.subtask_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.subtask_poll_interval_ms must be > 0".into(),
            ));
        }

        if !matches!(self.bridge.transport.as_str(), "telegram" | "ipc") {
            return Err(ConfigError::ValidationError(format!(
                "bridge.transport must be \"telegram\" or \"ipc\", got \"{}\"",
                self.bridge.transport
            )));
        }

        if !self.modes().iter().any(|m| m.slug == self.default_mode) {
            return Err(ConfigError::ValidationError(format!(
                "default_mode \"{}\" is not a known mode",
                self.default_mode
            )));
        }

        Ok(())
    }

    /// Built-in modes with custom ones layered on top by slug.
    pub fn modes(&self) -> Vec<Mode> {
        let mut modes = Mode::defaults();
        for custom in &self.modes {
            match modes.iter_mut().find(|m| m.slug == custom.slug) {
                Some(existing) => *existing = custom.clone(),
                None => modes.push(custom.clone()),
            }
        }
        modes
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            context_window: default_context_window(),
            default_mode: default_mode(),
            custom_instructions: None,
            runtime: RuntimeConfig::default(),
            auto_approve: AutoApproveConfig::default(),
            checkpoints: CheckpointConfig::default(),
            storage: StorageConfig::default(),
            bridge: BridgeConfig::default(),
            providers: HashMap::new(),
            modes: Vec::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
