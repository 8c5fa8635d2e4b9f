//! Unified error types for the pipeline
//!
//! Every failure in the sync pipeline maps to one of these variants so that
//! callers can decide what is retryable (rate limits, network), what is a
//! per-user fatality (auth), and what triggers a discovery fallback
//! (invalid cursor).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error type for the sync and enrichment pipeline
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum MailbriefError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token refresh rejected by the provider. Fatal for the affected
    /// user's tick only; other users keep syncing.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Provider returned 429 or a per-user quota was exhausted.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The stored sync cursor was rejected by the provider. Discovery
    /// falls back to a bounded full scan.
    #[error("Sync cursor invalid: {0}")]
    CursorInvalid(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Credential error: {0}")]
    Credential(String),

    /// Malformed LLM output or an unparseable provider payload.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Enrichment quota exceeded: {0}")]
    Quota(String),

    /// The caller did not present the scheduler tick secret.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl MailbriefError {
    /// True for errors the thread fetcher retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Network(_))
    }
}

// Implement From for common error types

impl From<std::io::Error> for MailbriefError {
    fn from(err: std::io::Error) -> Self {
        MailbriefError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for MailbriefError {
    fn from(err: toml::de::Error) -> Self {
        MailbriefError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MailbriefError {
    fn from(err: serde_json::Error) -> Self {
        MailbriefError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for MailbriefError {
    fn from(err: rusqlite::Error) -> Self {
        MailbriefError::Database(err.to_string())
    }
}

/// Result type alias using MailbriefError
pub type Result<T> = std::result::Result<T, MailbriefError>;
