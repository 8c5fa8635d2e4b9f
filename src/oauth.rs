//! OAuth refresh-token exchange
//!
//! Only the refresh grant is implemented; the interactive authorization
//! flow lives in the product that collects credentials in the first
//! place.

use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::OAuthConfig;
use crate::error::{MailbriefError, Result};

/// Tokens returned by a successful refresh
#[derive(Debug, Clone)]
pub struct OAuthTokens {
    pub access_token: String,
    /// Present only if the provider rotated the refresh token
    pub refresh_token: Option<String>,
    /// Absolute expiry (Unix seconds)
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Client for the provider token endpoint
pub struct OAuthClient {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl OAuthClient {
    pub fn new(config: &OAuthConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailbriefError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    /// Exchange a refresh token for a fresh access token
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| MailbriefError::Network(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailbriefError::Auth(format!(
                "Token refresh rejected ({}): {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| MailbriefError::Parse(format!("Invalid token response: {}", e)))?;

        debug!(expires_in = parsed.expires_in, "Refreshed access token");

        Ok(OAuthTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: Utc::now().timestamp() + parsed.expires_in,
        })
    }
}
