use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tutor::engine::default_system_prompt;
use crate::tutor::groq::GROQ_BASE_URL;
use crate::tutor::memory::DEFAULT_CONTEXT_MESSAGES;
use crate::tutor::sanitize::{DEFAULT_EMPHASIS_TRIGGERS, DEFAULT_SPOILER_TRIGGERS, FormatMode};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

/// Which API serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Any OpenAI-compatible endpoint, Groq by default.
    Groq,
    Anthropic,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: Provider,
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    #[serde(default)]
    groq_api_key: String,
    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_groq_base_url")]
    groq_base_url: String,
    #[serde(default)]
    anthropic_api_key: String,
    #[serde(default = "default_models")]
    models: Vec<ModelEntry>,
    /// Model for users who never picked one. Defaults to the first usable model.
    default_model: Option<String>,
    #[serde(default)]
    format_mode: FormatMode,
    /// Overrides the built-in tutor instruction.
    system_prompt: Option<String>,
    #[serde(default = "default_emphasis_triggers")]
    emphasis_triggers: Vec<String>,
    #[serde(default = "default_spoiler_triggers")]
    spoiler_triggers: Vec<String>,
    #[serde(default = "default_context_messages")]
    context_messages: usize,
    #[serde(default = "default_model_timeout_secs")]
    model_timeout_secs: u64,
    /// Directory for state files (logs, memory). Defaults to current directory.
    data_dir: Option<String>,
    /// Directory for per-user records. Defaults to `<data_dir>/bot_memory`.
    storage_dir: Option<String>,
}

fn default_groq_base_url() -> String {
    GROQ_BASE_URL.to_string()
}

fn default_models() -> Vec<ModelEntry> {
    [
        ("llama-3.3-70b-versatile", Provider::Groq),
        ("llama-3.1-8b-instant", Provider::Groq),
        ("claude-haiku-4-5-20251001", Provider::Anthropic),
        ("claude-sonnet-4-5-20250929", Provider::Anthropic),
    ]
    .into_iter()
    .map(|(id, provider)| ModelEntry { id: id.to_string(), provider })
    .collect()
}

fn default_emphasis_triggers() -> Vec<String> {
    DEFAULT_EMPHASIS_TRIGGERS.iter().map(|s| s.to_string()).collect()
}

fn default_spoiler_triggers() -> Vec<String> {
    DEFAULT_SPOILER_TRIGGERS.iter().map(|s| s.to_string()).collect()
}

fn default_context_messages() -> usize {
    DEFAULT_CONTEXT_MESSAGES
}

fn default_model_timeout_secs() -> u64 {
    60
}

pub struct Config {
    pub telegram_bot_token: String,
    pub groq_api_key: Option<String>,
    pub groq_base_url: String,
    pub anthropic_api_key: Option<String>,
    /// Models whose provider has credentials, in config order.
    pub models: Vec<ModelEntry>,
    pub default_model: String,
    pub format_mode: FormatMode,
    pub system_prompt: String,
    pub emphasis_triggers: Vec<String>,
    pub spoiler_triggers: Vec<String>,
    /// Turns sent to the model per call.
    pub context_messages: usize,
    pub model_timeout: Duration,
    /// Directory for state files (logs).
    pub data_dir: PathBuf,
    /// Directory for per-user records.
    pub storage_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let groq_api_key = non_empty(file.groq_api_key);
        let anthropic_api_key = non_empty(file.anthropic_api_key);

        let models: Vec<ModelEntry> = file
            .models
            .into_iter()
            .filter(|m| match m.provider {
                Provider::Groq => groq_api_key.is_some(),
                Provider::Anthropic => anthropic_api_key.is_some(),
            })
            .collect();
        if models.is_empty() {
            return Err(ConfigError::Validation(
                "no usable models: set groq_api_key or anthropic_api_key for at least one configured model".into()
            ));
        }

        let default_model = match file.default_model {
            Some(id) if models.iter().any(|m| m.id == id) => id,
            Some(id) => {
                return Err(ConfigError::Validation(format!(
                    "default_model '{id}' is not a configured model with credentials"
                )));
            }
            None => models[0].id.clone(),
        };

        if file.context_messages == 0 {
            return Err(ConfigError::Validation("context_messages must be at least 1".into()));
        }
        if file.model_timeout_secs == 0 {
            return Err(ConfigError::Validation("model_timeout_secs must be at least 1".into()));
        }
        if file.emphasis_triggers.iter().chain(&file.spoiler_triggers).any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Validation("trigger phrases must not be empty".into()));
        }

        let system_prompt = file
            .system_prompt
            .unwrap_or_else(|| default_system_prompt(file.format_mode).to_string());

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let storage_dir = file
            .storage_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("bot_memory"));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            groq_api_key,
            groq_base_url: file.groq_base_url,
            anthropic_api_key,
            models,
            default_model,
            format_mode: file.format_mode,
            system_prompt,
            emphasis_triggers: file.emphasis_triggers,
            spoiler_triggers: file.spoiler_triggers,
            context_messages: file.context_messages,
            model_timeout: Duration::from_secs(file.model_timeout_secs),
            data_dir,
            storage_dir,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_config() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz",
            "groq_api_key": "gsk_test"
        }"#);
        let config = Config::load(file.path()).expect("should load valid config");
        assert_eq!(config.default_model, "llama-3.3-70b-versatile");
        assert_eq!(config.models.len(), 2);
        assert!(config.models.iter().all(|m| m.provider == Provider::Groq));
        assert_eq!(config.format_mode, FormatMode::Convert);
        assert_eq!(config.context_messages, 10);
        assert_eq!(config.model_timeout, Duration::from_secs(60));
        assert_eq!(config.storage_dir, PathBuf::from("./bot_memory"));
        assert_eq!(config.spoiler_triggers, vec!["Ответ:", "РЕШЕНИЕ:"]);
        assert!(config.system_prompt.contains("репетитор"));
        assert_eq!(config.groq_base_url, GROQ_BASE_URL);
    }

    #[test]
    fn test_strip_mode_gets_plain_prompt() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "anthropic_api_key": "sk-ant",
            "format_mode": "strip",
            "data_dir": "/var/lib/tutor"
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.format_mode, FormatMode::Strip);
        assert!(config.system_prompt.contains("без Markdown"));
        assert_eq!(config.default_model, "claude-haiku-4-5-20251001");
        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/tutor/bot_memory"));
    }

    #[test]
    fn test_custom_models_and_default() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "groq_api_key": "gsk",
            "models": [
                {"id": "mixtral", "provider": "groq"},
                {"id": "gemma", "provider": "groq"}
            ],
            "default_model": "gemma",
            "system_prompt": "custom"
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.default_model, "gemma");
        assert_eq!(config.system_prompt, "custom");
    }

    #[test]
    fn test_no_credentials() {
        let file = write_config(r#"{"telegram_bot_token": "123:abc"}"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("no usable models"));
    }

    #[test]
    fn test_default_model_without_credentials() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "groq_api_key": "gsk",
            "default_model": "claude-haiku-4-5-20251001"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("default_model"));
    }

    #[test]
    fn test_empty_trigger() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "groq_api_key": "gsk",
            "spoiler_triggers": ["Answer:", " "]
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("trigger"));
    }

    #[test]
    fn test_zero_context() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "groq_api_key": "gsk",
            "context_messages": 0
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("context_messages"));
    }

    #[test]
    fn test_empty_token() {
        let file = write_config(r#"{"telegram_bot_token": "", "groq_api_key": "gsk"}"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("telegram_bot_token"));
    }

    #[test]
    fn test_invalid_token_format() {
        for token in ["invalid_token_no_colon", "notanumber:ABCdef", "123456789:"] {
            let file = write_config(&format!(
                r#"{{"telegram_bot_token": "{token}", "groq_api_key": "gsk"}}"#
            ));
            let err = assert_err(Config::load(file.path()));
            assert!(matches!(err, ConfigError::Validation(_)), "token {token}");
        }
    }

    #[test]
    fn test_unknown_format_mode() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "groq_api_key": "gsk",
            "format_mode": "markdown"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}
