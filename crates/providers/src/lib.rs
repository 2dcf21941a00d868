//! Model provider implementations for tasklane.
//!
//! All providers implement the `tasklane_core::Provider` trait.
//! [`from_config`] picks one based on configuration.

pub mod openai_compat;
pub mod scripted;

pub use openai_compat::OpenAiCompatProvider;
pub use scripted::{ScriptStep, ScriptedProvider};

use std::sync::Arc;
use tasklane_config::AppConfig;
use tasklane_core::error::ProviderError;
use tasklane_core::provider::{ModelInfo, Provider};

/// Build the configured default provider.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.default_provider.as_str();
    let provider_cfg = config.providers.get(name);
    let api_key = provider_cfg
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.api_key.clone());
    let api_url = provider_cfg.and_then(|p| p.api_url.clone());

    let info = ModelInfo {
        context_window: config.context_window,
        max_output_tokens: Some(u64::from(config.default_max_tokens)),
    };

    let provider = match name {
        "ollama" => OpenAiCompatProvider::ollama(api_url.as_deref()),
        "openrouter" | "openai" => {
            let key = api_key.ok_or_else(|| {
                ProviderError::NotConfigured(format!("no API key for provider '{name}'"))
            })?;
            match (name, api_url) {
                (_, Some(url)) => OpenAiCompatProvider::new(name, url, key),
                ("openai", None) => OpenAiCompatProvider::openai(key),
                _ => OpenAiCompatProvider::openrouter(key),
            }
        }
        other => {
            let url = api_url.ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "provider '{other}' needs providers.{other}.api_url"
                ))
            })?;
            OpenAiCompatProvider::new(other, url, api_key.unwrap_or_default())
        }
    };

    Ok(Arc::new(provider.with_model_info(info)))
}
