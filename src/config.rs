use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ai::RetryPolicy;
use crate::strip::StripOptions;

/// Top-level configuration.
///
/// Every section has defaults, so a partial `config.json` (or none at all)
/// is fine.
///
/// ```rust,no_run
/// use metatag::config::Config;
/// use std::path::Path;
///
/// let mut config = Config::load(Some(Path::new("config.json"))).unwrap();
/// config.model.provider = "openai".into();
/// config.model.api_key = "sk-...".into();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which vision model to call and with what key.
    pub model: ModelConfig,
    /// Backoff for transient model failures.
    pub retry: RetryConfig,
    /// Workspace and encoder behavior.
    pub output: OutputConfig,
}

/// Vision model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// `"gemini"` or `"openai"`.
    pub provider: String,
    /// Provider model name; blank means the provider default.
    pub model: String,
    /// Used when no key is given on the command line or in the environment.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Keep the scratch workspace after the run instead of deleting it.
    pub keep_workspace: bool,
    /// JPEG quality for RAW files converted by the stripper.
    pub raw_jpeg_quality: u8,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: crate::ai::GEMINI_DEFAULT_MODEL.to_string(),
            api_key: String::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            keep_workspace: false,
            raw_jpeg_quality: StripOptions::default().raw_jpeg_quality,
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::debug!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
        )
    }

    pub fn strip_options(&self) -> StripOptions {
        StripOptions {
            raw_jpeg_quality: self.output.raw_jpeg_quality.clamp(1, 100),
        }
    }

    /// Pick the API key: an explicit value wins, then the config file.
    /// Blank values count as missing.
    pub fn resolve_api_key(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .or_else(|| Some(self.model.api_key.trim()).filter(|k| !k.is_empty()))
            .map(String::from)
    }
}
