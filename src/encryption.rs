//! At-rest encryption for stored OAuth tokens
//!
//! Uses AES-256-GCM with a key derived from the configured application
//! secret via Argon2id. The ciphertext envelope is base64(nonce || data).

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use argon2::{Argon2, ParamsBuilder};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{MailbriefError, Result};

/// Application-specific salt for key derivation
const APP_SALT: &[u8] = b"mailbrief.v1.token.encryption.salt";

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// Token cipher derived from the application secret
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(app_secret: &str) -> Result<Self> {
        let key = Self::derive_key(app_secret)?;
        let cipher = Aes256Gcm::new(&key.into());
        Ok(Self { cipher })
    }

    fn derive_key(app_secret: &str) -> Result<[u8; 32]> {
        let mut output_key = [0u8; 32];

        let params = ParamsBuilder::new()
            .m_cost(65536) // 64 MiB memory
            .t_cost(3)
            .p_cost(4)
            .build()
            .map_err(|e| {
                MailbriefError::Credential(format!("Failed to build Argon2 params: {}", e))
            })?;

        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        argon2
            .hash_password_into(app_secret.as_bytes(), APP_SALT, &mut output_key)
            .map_err(|e| {
                MailbriefError::Credential(format!("Argon2 key derivation failed: {}", e))
            })?;

        Ok(output_key)
    }

    /// Encrypt a plaintext string
    ///
    /// Returns a base64-encoded string containing: nonce || ciphertext
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Err(MailbriefError::Credential(
                "Cannot encrypt empty plaintext".to_string(),
            ));
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| MailbriefError::Credential(format!("Encryption failed: {}", e)))?;

        let mut envelope = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(nonce.as_slice());
        envelope.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(envelope))
    }

    /// Decrypt a base64-encoded nonce || ciphertext envelope
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let envelope = BASE64.decode(encrypted).map_err(|e| {
            MailbriefError::Credential(format!("Invalid encrypted data format: {}", e))
        })?;

        if envelope.len() <= NONCE_SIZE {
            return Err(MailbriefError::Credential(
                "Encrypted data too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| MailbriefError::Credential(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| MailbriefError::Credential(format!("Decrypted data not UTF-8: {}", e)))
    }
}
