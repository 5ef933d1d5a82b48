use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for the completion client and match engine. All fields have
/// defaults matching the documented retry/tie constants, so a config file is
/// optional.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// OpenAI-compatible API endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    #[serde(default = "default_env_var_api_key")]
    pub env_var_api_key: String,
    /// Attempts before giving up on a completion call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait between attempts
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Sampling temperature for judge calls
    #[serde(default)]
    pub temperature: f64,
    /// Maximum output tokens for judge calls
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_env_var_api_key() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_retries() -> u32 {
    16
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            env_var_api_key: default_env_var_api_key(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}
