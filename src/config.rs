use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::catalog::ModelInfo;
use crate::relay::gemini::DEFAULT_BASE_URL;

/// Default model when neither `GEMINI_MODEL` nor the config file names one.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
const ENV_GEMINI_MODEL: &str = "GEMINI_MODEL";

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// A required setting was given neither in the environment nor the file.
    MissingVar(&'static str),
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
            Self::MissingVar(name) => {
                write!(f, "{} is not set (environment or config file)", name)
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
            Self::MissingVar(_) | Self::Validation(_) => None,
        }
    }
}

/// A pinned model: either a bare id or an id with a display name.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Id(String),
    Named { id: String, display_name: Option<String> },
}

impl From<ModelEntry> for ModelInfo {
    fn from(entry: ModelEntry) -> Self {
        match entry {
            ModelEntry::Id(id) => ModelInfo::from_id(id),
            ModelEntry::Named { id, display_name: Some(name) } => ModelInfo::new(id, name),
            ModelEntry::Named { id, display_name: None } => ModelInfo::from_id(id),
        }
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    telegram_token: Option<String>,
    gemini_api_key: Option<String>,
    default_model: Option<String>,
    /// Pinned supported models. Disables discovery when set.
    models: Option<Vec<ModelEntry>>,
    /// Directory for log files. Defaults to current directory.
    data_dir: Option<String>,
    gemini_base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_model_cache_ttl_secs")]
    model_cache_ttl_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_model_cache_ttl_secs() -> u64 {
    300
}

pub struct Config {
    pub telegram_token: String,
    pub gemini_api_key: String,
    pub default_model: String,
    /// Pinned model list, if any.
    pub models: Option<Vec<ModelInfo>>,
    /// Directory for log files.
    pub data_dir: PathBuf,
    pub gemini_base_url: String,
    pub request_timeout: Duration,
    /// How often the model list is refreshed from the API.
    pub model_cache_ttl: Duration,
}

impl Config {
    /// Load from the optional config file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::resolve(path, |name| std::env::var(name).ok())
    }

    /// Environment values win over the file.
    fn resolve<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match path {
            Some(path) => read_file(path)?,
            None => ConfigFile {
                request_timeout_secs: default_request_timeout_secs(),
                model_cache_ttl_secs: default_model_cache_ttl_secs(),
                ..ConfigFile::default()
            },
        };

        let env = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_token = env(ENV_TELEGRAM_TOKEN)
            .or(file.telegram_token)
            .ok_or(ConfigError::MissingVar(ENV_TELEGRAM_TOKEN))?;
        let gemini_api_key = env(ENV_GEMINI_API_KEY)
            .or(file.gemini_api_key)
            .ok_or(ConfigError::MissingVar(ENV_GEMINI_API_KEY))?;
        let default_model = env(ENV_GEMINI_MODEL)
            .or(file.default_model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }
        if gemini_api_key.trim().is_empty() {
            return Err(ConfigError::Validation("gemini_api_key must not be empty".into()));
        }
        if default_model.trim().is_empty() {
            return Err(ConfigError::Validation("default_model must not be empty".into()));
        }
        if file.request_timeout_secs == 0 {
            return Err(ConfigError::Validation("request_timeout_secs must be greater than 0".into()));
        }
        if file.model_cache_ttl_secs == 0 {
            return Err(ConfigError::Validation("model_cache_ttl_secs must be greater than 0".into()));
        }

        let models = match file.models {
            Some(entries) if entries.is_empty() => {
                return Err(ConfigError::Validation("models must not be an empty list".into()));
            }
            Some(entries) => Some(entries.into_iter().map(ModelInfo::from).collect()),
            None => None,
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_token,
            gemini_api_key,
            default_model: default_model.trim().to_string(),
            models,
            data_dir,
            gemini_base_url: file
                .gemini_base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            model_cache_ttl: Duration::from_secs(file.model_cache_ttl_secs),
        })
    }

    /// Whether the model list should be discovered from the API.
    pub fn discover_models(&self) -> bool {
        self.models.is_none()
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFile { path: path.to_path_buf(), source: e })?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::ParseJson { path: path.to_path_buf(), source: e })
}
