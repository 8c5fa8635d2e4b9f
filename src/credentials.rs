//! Credential store for provider OAuth tokens
//!
//! Tokens are encrypted with the application cipher before they hit the
//! database and decrypted on the way out, so plaintext tokens only ever
//! live in memory.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::encryption::TokenCipher;
use crate::error::{MailbriefError, Result};
use crate::sync::db::{CredentialRow, SyncDatabase};

/// Refresh when the access token is within this many seconds of expiry
const REFRESH_SKEW_SECS: i64 = 60;

/// A decrypted provider credential
#[derive(Debug, Clone)]
pub struct Credential {
    pub user_email: String,
    pub provider: String,
    pub refresh_token: String,
    pub access_token: String,
    /// Absolute access-token expiry (Unix seconds)
    pub expires_at: i64,
    pub sync_cursor: Option<String>,
}

impl Credential {
    /// True if the access token is expired or within the refresh skew
    pub fn needs_refresh(&self) -> bool {
        Utc::now().timestamp() + REFRESH_SKEW_SECS >= self.expires_at
    }
}

/// Store that encrypts tokens at rest
pub struct CredentialStore {
    db: Arc<SyncDatabase>,
    cipher: TokenCipher,
}

impl CredentialStore {
    pub fn new(db: Arc<SyncDatabase>, cipher: TokenCipher) -> Self {
        Self { db, cipher }
    }

    /// All connected users for a provider, tokens decrypted
    pub fn list_for_provider(&self, provider: &str) -> Result<Vec<Credential>> {
        let rows = self.db.list_credentials(provider)?;
        rows.iter().map(|row| self.decrypt_row(row)).collect()
    }

    pub fn get(&self, user_email: &str, provider: &str) -> Result<Option<Credential>> {
        match self.db.get_credential(user_email, provider)? {
            Some(row) => Ok(Some(self.decrypt_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Store a credential, encrypting both tokens
    pub fn upsert(&self, credential: &Credential) -> Result<()> {
        if credential.refresh_token.is_empty() {
            return Err(MailbriefError::Credential(
                "Refresh token must not be empty".to_string(),
            ));
        }
        let row = CredentialRow {
            user_email: credential.user_email.clone(),
            provider: credential.provider.clone(),
            encrypted_refresh_token: self.cipher.encrypt(&credential.refresh_token)?,
            encrypted_access_token: self.cipher.encrypt(&credential.access_token)?,
            expires_at: credential.expires_at,
            sync_cursor: credential.sync_cursor.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.db.upsert_credential(&row)?;
        debug!(user = %credential.user_email, "Stored credential");
        Ok(())
    }

    /// Persist refreshed tokens for an existing credential
    pub fn update_tokens(
        &self,
        user_email: &str,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<()> {
        self.db.update_credential_tokens(
            user_email,
            provider,
            &self.cipher.encrypt(access_token)?,
            &self.cipher.encrypt(refresh_token)?,
            expires_at,
        )
    }

    /// Advance the sync cursor. Called only after discovered changes have
    /// been fully persisted.
    pub fn update_cursor(&self, user_email: &str, provider: &str, cursor: &str) -> Result<()> {
        self.db.update_sync_cursor(user_email, provider, cursor)
    }

    pub fn delete(&self, user_email: &str, provider: &str) -> Result<()> {
        self.db.delete_credential(user_email, provider)
    }

    fn decrypt_row(&self, row: &CredentialRow) -> Result<Credential> {
        Ok(Credential {
            user_email: row.user_email.clone(),
            provider: row.provider.clone(),
            refresh_token: self.cipher.decrypt(&row.encrypted_refresh_token)?,
            access_token: self.cipher.decrypt(&row.encrypted_access_token)?,
            expires_at: row.expires_at,
            sync_cursor: row.sync_cursor.clone(),
        })
    }
}
