//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use parley_core::ProfileEntry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider name, used in logs and domain events
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub client: ClientConfig,

    /// Organization and user profile text injected into prompts
    #[serde(default)]
    pub profiles: Vec<ProfileEntry>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

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
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("engine", &self.engine)
            .field("context", &self.context)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("client", &self.client)
            .field("profiles", &self.profiles.len())
            .finish()
    }
}

/// Execution graph and tool executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Cap on model invocations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Tool calls of one batch that may run at once
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the user.".into()
}
fn default_max_iterations() -> u32 {
    10
}
fn default_tool_concurrency() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_turn_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            tool_concurrency: default_tool_concurrency(),
            tool_timeout_secs: default_tool_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

/// How history is bounded per turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimStrategy {
    /// Keep as many recent messages as fit `history_tokens`
    #[default]
    Tokens,
    /// Keep the last `max_messages` messages regardless of size
    Messages,
}

/// Context assembler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Estimated-token budget for the system entry (instructions, profile, files)
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,

    #[serde(default)]
    pub trim: TrimStrategy,

    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    #[serde(default = "default_history_tokens")]
    pub history_tokens: usize,
}

fn default_budget_tokens() -> usize {
    2_000
}
fn default_max_messages() -> usize {
    20
}
fn default_history_tokens() -> usize {
    6_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            trim: TrimStrategy::default(),
            max_messages: default_max_messages(),
            history_tokens: default_history_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file; `None` means `~/.parley/parley.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("parley.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Settings for the `parley chat` client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway base URL; `None` derives it from `[gateway]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra attempts for a failed message save
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
}

fn default_persist_retries() -> u32 {
    2
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            persist_retries: default_persist_retries(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment overrides:
    /// - `PARLEY_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `PARLEY_MODEL`
    /// - `PARLEY_API_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
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

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.model = model;
        }
        if let Some(url) = lookup("PARLEY_API_URL") {
            self.api_url = url;
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.engine.max_iterations == 0 {
            return Err(ConfigError::ValidationError("engine.max_iterations must be > 0".into()));
        }
        if self.engine.tool_concurrency == 0 {
            return Err(ConfigError::ValidationError("engine.tool_concurrency must be > 0".into()));
        }
        if self.engine.tool_timeout_secs == 0 || self.engine.turn_timeout_secs == 0 {
            return Err(ConfigError::ValidationError("engine timeouts must be > 0".into()));
        }
        if self.context.trim == TrimStrategy::Messages && self.context.max_messages == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_messages must be > 0 when trim = \"messages\"".into(),
            ));
        }
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// The gateway URL the chat client should talk to.
    pub fn client_url(&self) -> String {
        self.client
            .url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.gateway.host, self.gateway.port))
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: default_provider(),
            api_url: default_api_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            engine: EngineConfig::default(),
            context: ContextConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            client: ClientConfig::default(),
            profiles: Vec::new(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_iterations, 10);
        assert_eq!(config.engine.tool_concurrency, 4);
        assert_eq!(config.context.trim, TrimStrategy::Tokens);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.engine.turn_timeout_secs, 300);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.engine.tool_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider, "openai");
    }

    #[test]
    fn load_from_file_with_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
model = "local-model"

[engine]
max_iterations = 3

[context]
trim = "messages"
max_messages = 8

[store]
backend = "memory"

[[profiles]]
org_id = "acme"
company = "Acme builds anvils."
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.model, "local-model");
        assert_eq!(config.engine.max_iterations, 3);
        assert_eq!(config.engine.tool_concurrency, 4);
        assert_eq!(config.context.trim, TrimStrategy::Messages);
        assert_eq!(config.context.max_messages, 8);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].org_id, "acme");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = [").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn env_overrides_take_priority() {
        let env: HashMap<&str, &str> = [
            ("PARLEY_API_KEY", "pk-1"),
            ("OPENAI_API_KEY", "sk-2"),
            ("PARLEY_MODEL", "gpt-x"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("pk-1"));
        assert_eq!(config.model, "gpt-x");
        assert_eq!(config.api_url, default_api_url());
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn client_url_defaults_to_gateway_address() {
        let config = AppConfig::default();
        assert_eq!(config.client_url(), "http://127.0.0.1:42618");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("42618"));
    }
}
