//! Token lifecycle management
//!
//! Hands out valid access tokens, refreshing through the provider when
//! needed. Refresh for a given (user, provider) pair is serialized with
//! an advisory lock; the loser of a race re-reads the credential and
//! usually finds a token the winner just persisted.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::credentials::CredentialStore;
use crate::error::{MailbriefError, Result};
use crate::lock::DistributedMutex;
use crate::oauth::{OAuthClient, OAuthTokens};

/// Refresh-grant seam, so the manager can be exercised without HTTP
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens>;
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        OAuthClient::refresh(self, refresh_token).await
    }
}

/// What the rest of the pipeline needs from token management
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self, user_email: &str, provider: &str) -> Result<String>;
}

#[async_trait]
impl AccessTokenProvider for TokenManager {
    async fn access_token(&self, user_email: &str, provider: &str) -> Result<String> {
        self.get_valid_access_token(user_email, provider).await
    }
}

pub struct TokenManager {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    mutex: Arc<dyn DistributedMutex>,
}

impl TokenManager {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        mutex: Arc<dyn DistributedMutex>,
    ) -> Self {
        Self {
            store,
            refresher,
            mutex,
        }
    }

    /// Get a valid access token for the user, refreshing if the stored
    /// one is expired or inside the refresh skew
    pub async fn get_valid_access_token(&self, user_email: &str, provider: &str) -> Result<String> {
        let credential = self
            .store
            .get(user_email, provider)?
            .ok_or_else(|| {
                MailbriefError::Credential(format!("No credential for {}", user_email))
            })?;

        if !credential.needs_refresh() {
            return Ok(credential.access_token);
        }

        let lock_key = format!("token:{}:{}", user_email, provider);
        let lock = self.mutex.acquire(&lock_key).await?;

        let result = self.refresh_locked(user_email, provider).await;

        // Release before propagating so a refresh failure cannot hold the key
        self.mutex.release(lock).await?;
        result
    }

    async fn refresh_locked(&self, user_email: &str, provider: &str) -> Result<String> {
        // Re-read under the lock: a concurrent holder may have refreshed
        // while we waited
        let credential = self
            .store
            .get(user_email, provider)?
            .ok_or_else(|| {
                MailbriefError::Credential(format!("No credential for {}", user_email))
            })?;

        if !credential.needs_refresh() {
            debug!(user = %user_email, "Token already refreshed by another holder");
            return Ok(credential.access_token);
        }

        let tokens = self.refresher.refresh(&credential.refresh_token).await?;

        // Providers may omit the refresh token from the response; the old
        // one stays valid in that case
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .unwrap_or(&credential.refresh_token);

        self.store.update_tokens(
            user_email,
            provider,
            &tokens.access_token,
            refresh_token,
            tokens.expires_at,
        )?;

        info!(user = %user_email, "Refreshed access token");
        Ok(tokens.access_token)
    }
}
