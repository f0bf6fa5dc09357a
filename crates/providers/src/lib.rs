//! Model provider implementations for Parley.
//!
//! All providers implement the `parley_core::Provider` trait. The gateway
//! builds one from configuration with [`build_from_config`].

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use parley_config::AppConfig;
use parley_core::error::ProviderError;
use parley_core::provider::Provider;
use std::sync::Arc;

/// Local servers that accept any key.
const KEYLESS_PROVIDERS: [&str; 3] = ["ollama", "vllm", "llamacpp"];

/// Build the configured provider.
///
/// Every backend speaks the OpenAI chat-completions protocol; `provider`
/// only names it and decides whether an API key is required.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.provider.as_str();
    let api_key = match config.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => key.to_string(),
        None if KEYLESS_PROVIDERS.contains(&name) => name.to_string(),
        None => {
            return Err(ProviderError::NotConfigured(format!(
                "provider '{name}' needs an API key (set PARLEY_API_KEY or api_key in config.toml)"
            )));
        }
    };

    tracing::debug!(provider = name, api_url = %config.api_url, "Building provider");
    Ok(Arc::new(OpenAiCompatProvider::new(name, &config.api_url, api_key)))
}
