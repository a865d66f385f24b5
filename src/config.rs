use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{Result, BrokerError};

// Default values for optional configuration fields
fn default_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key for the chat completion endpoint
    pub key: String,
    /// Base URL of an OpenAI compatible endpoint; `/v1` is added when missing
    pub base_url: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Models known to accept `response_format: {"type": "json_object"}`
    pub json_models: Vec<String>,
    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Directory holding one JSON array per log partition
    pub log_dir: PathBuf,
    /// Attempts shared by transport, decode and validation failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed pause between attempts
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling application log
    pub dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                key: String::new(),
                base_url: "https://api.deepseek.com".to_string(),
                model: "deepseek-chat".to_string(),
                json_models: vec![
                    "gpt-4o".to_string(),
                    "gpt-4o-mini".to_string(),
                    "deepseek-chat".to_string(),
                ],
                timeout_secs: default_timeout_secs(),
            },
            broker: BrokerConfig {
                log_dir: PathBuf::from("output/gpt_log"),
                max_attempts: default_max_attempts(),
                retry_delay_secs: default_retry_delay_secs(),
            },
            logging: LoggingConfig {
                dir: PathBuf::from(".gptlog/log"),
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| BrokerError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BrokerError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| BrokerError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Apply `API_KEY`, `BASE_URL` and `MODEL` from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(key) = lookup("API_KEY").filter(|v| !v.trim().is_empty()) {
            self.api.key = key;
        }
        if let Some(base_url) = lookup("BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.api.base_url = base_url;
        }
        if let Some(model) = lookup("MODEL").filter(|v| !v.trim().is_empty()) {
            self.api.model = model;
        }
    }
}

impl ApiConfig {
    /// Full chat completion URL derived from `base_url`
    pub fn completions_url(&self) -> String {
        let base = self.base_url.trim().trim_end_matches('/');
        let base = if base.contains("v1") {
            base.to_string()
        } else {
            format!("{}/v1", base)
        };
        format!("{}/chat/completions", base)
    }

    pub fn supports_json_mode(&self, model: &str) -> bool {
        self.json_models.iter().any(|m| m == model)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BrokerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}
