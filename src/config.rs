//! Catalog configuration.
//!
//! Configuration is stored in a YAML file (`config.yaml` by default) and includes:
//! - Vision-model API endpoint, model name, credentials and timeout
//! - Prompts sent with every image
//! - Supported image extensions and exclusion globs
//! - Concurrency and queue limits

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant specialized in image analysis.
You must respond in valid JSON format ONLY, without any extra text.
The JSON must contain two keys:
1. "short_name": a short, descriptive name for the image.
2. "description": a detailed description of the image in English.

Example output format:
{"short_name": "Sunset on the beach", "description": "The image shows a sunset at sea..."}"#;

/// Main configuration structure
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chat-completions endpoint of the vision model
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Optional bearer token for the API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Request timeout in seconds (default: 60)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Instruction text sent alongside the image
    #[serde(default = "default_user_prompt")]
    pub user_prompt: String,

    /// File extensions treated as images (case-insensitive)
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,

    /// Glob patterns for files and directories to skip
    #[serde(default)]
    pub exclude_filter: Vec<String>,

    /// Maximum number of analysis requests in flight per directory (default: 3)
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: usize,

    /// Buffered reindex tasks before new ones are dropped (default: 100)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Quiet period for coalescing filesystem events, in milliseconds
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_api_url() -> String {
    "http://localhost:1234/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "llava-v1.5-7b".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_user_prompt() -> String {
    "Analyze this image and provide a short name and description.".to_string()
}

fn default_supported_extensions() -> Vec<String> {
    [".png", ".jpg", ".jpeg", ".webp", ".gif", ".bmp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_parallel_requests() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_watch_debounce_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            api_key: None,
            timeout: default_timeout(),
            system_prompt: default_system_prompt(),
            user_prompt: default_user_prompt(),
            supported_extensions: default_supported_extensions(),
            exclude_filter: Vec::new(),
            parallel_requests: default_parallel_requests(),
            queue_capacity: default_queue_capacity(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("supported_extensions", &self.supported_extensions)
            .field("exclude_filter", &self.exclude_filter)
            .field("parallel_requests", &self.parallel_requests)
            .field("queue_capacity", &self.queue_capacity)
            .field("watch_debounce_ms", &self.watch_debounce_ms)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration.
    ///
    /// With `None`, reads `config.yaml` from the working directory if present and
    /// falls back to the built-in defaults otherwise. An explicitly named file
    /// must exist. The result is normalized and validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| CatalogError::storage("read config", &path, e))?;
            Self::from_yaml(&content)?
        } else if required {
            return Err(CatalogError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        } else {
            tracing::info!("no {DEFAULT_CONFIG_FILE} found, using default configuration");
            Config::default()
        };

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without validating it.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        crate::fs::write_file_atomic(path, &content)
    }

    /// Lowercase extensions and make sure each carries a leading dot.
    pub fn normalize(&mut self) {
        for ext in &mut self.supported_extensions {
            let lower = ext.trim().to_lowercase();
            *ext = if lower.starts_with('.') {
                lower
            } else {
                format!(".{lower}")
            };
        }
        let mut seen = HashSet::new();
        self.supported_extensions.retain(|ext| seen.insert(ext.clone()));
    }

    /// Reject values the catalog cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(CatalogError::Config("api_url is required".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(CatalogError::Config("model is required".to_string()));
        }
        if self.timeout == 0 {
            return Err(CatalogError::Config("timeout must be positive".to_string()));
        }
        if self.parallel_requests == 0 {
            return Err(CatalogError::Config(
                "parallel_requests must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(CatalogError::Config(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.supported_extensions.is_empty() {
            return Err(CatalogError::Config(
                "supported_extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}
