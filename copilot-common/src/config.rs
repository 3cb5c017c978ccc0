//! Configuration management for Copilot services.
//!
//! All Copilot services share a configuration file at `~/.copilot/config.json`.
//! Every field has a default, so a missing file or a partial file is valid.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (COPILOT_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `COPILOT_LOG_LEVEL` → observability.log_level
//! - `COPILOT_LOG_FORMAT` → observability.log_format
//! - `COPILOT_STORE_BACKEND` → store.backend
//! - `COPILOT_STORE_DIR` → store.dir
//! - `COPILOT_REDIS_URL` → store.redis_url
//! - `COPILOT_MAX_TOKEN_SIZE` → session.max_token_size
//! - `COPILOT_SESSION_TTL_MS` → session.ttl_ms

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".copilot"),
        |dirs| dirs.home_dir().join(".copilot"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Chat session cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Token budget for prompt + windowed history (default: 3840)
    #[serde(default = "default_max_token_size")]
    pub max_token_size: usize,

    /// Time-to-live of a stored session since its last write, in milliseconds
    /// (default: 43,200,000 = 12 hours)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Namespace prefix of session keys; the key is `{prefix}:{session_id}`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Model used when the caller does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Prompt used when the caller does not name one
    #[serde(default = "default_prompt")]
    pub default_prompt: String,
}

fn default_max_token_size() -> usize {
    3840
}

fn default_ttl_ms() -> u64 {
    3600 * 12 * 1000
}

fn default_key_prefix() -> String {
    "chat-session".into()
}

fn default_model() -> String {
    "gpt-4".into()
}

fn default_prompt() -> String {
    "chat:general".into()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_token_size: default_max_token_size(),
            ttl_ms: default_ttl_ms(),
            key_prefix: default_key_prefix(),
            default_model: default_model(),
            default_prompt: default_prompt(),
        }
    }
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Session store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map (single process, lost on exit).
    #[default]
    Memory,
    /// One JSON file per session under `store.dir`.
    File,
    /// Redis (multi-process, requires the `redis-backend` feature).
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "redis" => Ok(Self::Redis),
            other => Err(crate::Error::Config(format!(
                "unknown store backend '{other}' (expected memory, file or redis)"
            ))),
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the file backend (default: `~/.copilot/sessions`)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Redis URL (redis://host:port)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dir: None,
            redis_url: default_redis_url(),
        }
    }
}

impl StoreConfig {
    /// Directory used by the file backend.
    pub fn dir_or_default(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| config_dir().join("sessions"))
    }
}

// ============================================================================
// Tokenizer Configuration
// ============================================================================

/// Tokenizer backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerBackend {
    /// Exact BPE counting via tiktoken.
    #[default]
    Tiktoken,
    /// chars/4 estimate for an explicit model list.
    Estimate,
}

/// Tokenizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub backend: TokenizerBackend,

    /// Number of model vocabularies kept loaded (default: 8)
    #[serde(default = "default_tokenizer_cache_size")]
    pub cache_size: usize,

    /// Models accepted by the estimate backend
    #[serde(default = "default_estimate_models")]
    pub estimate_models: Vec<String>,
}

fn default_tokenizer_cache_size() -> usize {
    8
}

fn default_estimate_models() -> Vec<String> {
    vec!["gpt-4".into(), "gpt-4o".into(), "gpt-3.5-turbo".into()]
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            backend: TokenizerBackend::default(),
            cache_size: default_tokenizer_cache_size(),
            estimate_models: default_estimate_models(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Prompt Configuration
// ============================================================================

/// One seed message of a named prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessageConfig {
    /// "system", "user" or "assistant"
    pub role: String,
    pub content: String,
}

const PROMPT_ROLES: &[&str] = &["system", "user", "assistant"];

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Named seed prompts: name -> ordered messages
    #[serde(default)]
    pub prompts: HashMap<String, Vec<PromptMessageConfig>>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides, then validate.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("COPILOT_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("COPILOT_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Some(backend) = lookup("COPILOT_STORE_BACKEND") {
            match backend.parse() {
                Ok(b) => self.store.backend = b,
                Err(e) => tracing::warn!(error = %e, "Ignoring COPILOT_STORE_BACKEND"),
            }
        }
        if let Some(dir) = lookup("COPILOT_STORE_DIR") {
            self.store.dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup("COPILOT_REDIS_URL") {
            self.store.redis_url = url;
        }

        if let Some(size) = lookup("COPILOT_MAX_TOKEN_SIZE") {
            match size.parse() {
                Ok(s) => self.session.max_token_size = s,
                Err(_) => tracing::warn!(value = %size, "Ignoring COPILOT_MAX_TOKEN_SIZE"),
            }
        }
        if let Some(ttl) = lookup("COPILOT_SESSION_TTL_MS") {
            match ttl.parse() {
                Ok(t) => self.session.ttl_ms = t,
                Err(_) => tracing::warn!(value = %ttl, "Ignoring COPILOT_SESSION_TTL_MS"),
            }
        }
    }

    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.session.max_token_size == 0 {
            return Err(crate::Error::Config(
                "session.max_token_size must be greater than zero".into(),
            ));
        }
        if self.session.ttl_ms == 0 {
            return Err(crate::Error::Config(
                "session.ttl_ms must be greater than zero".into(),
            ));
        }
        if self.session.key_prefix.is_empty() {
            return Err(crate::Error::Config(
                "session.key_prefix must not be empty".into(),
            ));
        }
        if self.tokenizer.cache_size == 0 {
            return Err(crate::Error::Config(
                "tokenizer.cache_size must be greater than zero".into(),
            ));
        }
        for (name, messages) in &self.prompts {
            if let Some(bad) = messages
                .iter()
                .find(|m| !PROMPT_ROLES.contains(&m.role.as_str()))
            {
                return Err(crate::Error::Config(format!(
                    "prompt '{name}' has unknown role '{}'",
                    bad.role
                )));
            }
        }
        Ok(())
    }
}
