//! Configuration management
//!
//! The pipeline is configured from a single TOML file. The path is taken
//! from `MAILBRIEF_CONFIG`, a `--config` argument, or the first existing
//! default path.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::MailbriefError;

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Shared secret the external scheduler must present on every tick
    pub tick_secret: String,

    /// Secret used to derive the at-rest encryption key for OAuth tokens
    pub app_secret: String,

    /// SQLite database file path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Timeout applied to every provider and LLM HTTP request, in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    pub oauth: OAuthConfig,

    pub org: OrgConfig,

    pub llm: LlmConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// OAuth client configuration for the refresh-token exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Token endpoint URL
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

/// Organization-level classification rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgConfig {
    /// Addresses on this domain count as internal participants
    pub domain: String,
    /// Dedicated support inbox address (highest-precedence category signal)
    pub support_address: String,
    /// Dedicated onboarding inbox address
    pub onboarding_address: String,
    /// Extra provider labels to skip, on top of the built-in spam/trash/
    /// promotions/social/updates set
    #[serde(default)]
    pub skip_labels: Vec<String>,
}

/// LLM endpoint configuration for the enrichment worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Tunable pipeline bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Message bound for the first-sync full scan
    #[serde(default = "default_first_sync_max_messages")]
    pub first_sync_max_messages: usize,
    /// Per-user daily cap on generated summaries (sliding 24h window)
    #[serde(default = "default_daily_summary_limit")]
    pub daily_summary_limit: i64,
    /// Maximum pending archive actions drained per tick
    #[serde(default = "default_archive_batch_limit")]
    pub archive_batch_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            first_sync_max_messages: default_first_sync_max_messages(),
            daily_summary_limit: default_daily_summary_limit(),
            archive_batch_limit: default_archive_batch_limit(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("mailbrief.db")
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_first_sync_max_messages() -> usize {
    100
}

fn default_daily_summary_limit() -> i64 {
    100
}

fn default_archive_batch_limit() -> usize {
    50
}

/// Get default config paths, in priority order
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailbrief").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mailbrief").join("config.toml"));
    }

    paths.push(PathBuf::from("config.toml"));

    paths
}

impl AppConfig {
    /// Load configuration from an explicit path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MailbriefError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MailbriefError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from the first existing default path
    pub fn load_default() -> Result<Self, MailbriefError> {
        for path in default_config_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Err(MailbriefError::Config(
            "No config file found in default locations".to_string(),
        ))
    }

    fn validate(&self) -> Result<(), MailbriefError> {
        if self.tick_secret.is_empty() {
            return Err(MailbriefError::Config("tick_secret must not be empty".into()));
        }
        if self.app_secret.is_empty() {
            return Err(MailbriefError::Config("app_secret must not be empty".into()));
        }
        if self.org.domain.is_empty() {
            return Err(MailbriefError::Config("org.domain must not be empty".into()));
        }
        Ok(())
    }
}
