use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Context;
use serde::Deserialize;
use crate::core::{UploadOptions, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES};
use crate::transport::HttpTransportConfig;
use crate::utils::retry::Backoff;

fn default_state_dir() -> PathBuf {
    PathBuf::from(".resumable-upload")
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    300
}

/// Settings of the command line uploader, read from a TOML file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub endpoint: String,
    pub file_path: PathBuf,
    /// Sent as the `Authorization` header when present.
    #[serde(default)]
    pub token: Option<String>,
    /// Where sessions are persisted between runs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("Can't load {}", path.display()))
    }

    pub fn from_toml_str(config_str: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(config_str)?;
        config.upload_options().validate()?;
        Ok(config)
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions::default()
            .with_chunk_size(self.chunk_size)
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_backoff(self.backoff)
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        let mut config = HttpTransportConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            ..Default::default()
        };

        if let Some(token) = &self.token {
            config.headers.insert("Authorization".to_string(), token.clone());
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(r#"
            endpoint = "http://localhost:8080/upload"
            file_path = "video.mp4"
        "#).unwrap();

        assert!(config.endpoint.starts_with("http"));
        assert_eq!(config.token, None);
        assert_eq!(config.state_dir, PathBuf::from(".resumable-upload"));
        assert_eq!(config.upload_options(), UploadOptions::default());
        assert!(config.transport_config().headers.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(r#"
            endpoint = "http://localhost:8080/upload"
            file_path = "video.mp4"
            token = "Bearer abc"
            state_dir = "/tmp/sessions"
            chunk_size = 4096
            max_retries = 5
            retry_delay_ms = 250
            backoff = "exponential"
            timeout_secs = 30
        "#).unwrap();

        let options = config.upload_options();
        assert_eq!(options.chunk_size, 4096);
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
        assert_eq!(options.backoff, Backoff::Exponential);

        let transport = config.transport_config();
        assert_eq!(transport.timeout, Duration::from_secs(30));
        assert_eq!(transport.headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = Config::from_toml_str(r#"
            endpoint = "http://localhost:8080/upload"
            file_path = "video.mp4"
            chunk_size = 0
        "#);
        assert!(result.is_err());
    }
}
