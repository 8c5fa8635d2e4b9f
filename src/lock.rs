//! Advisory locks for serializing token refresh
//!
//! Multiple pipeline instances may share one database. The mutex trait
//! hides the backing store; the SQLite implementation uses a single-row
//! compare-and-swap with a TTL so a crashed holder cannot wedge the key
//! forever.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MailbriefError, Result};
use crate::sync::db::SyncDatabase;

/// Proof of lock ownership. Must be passed back to `release`.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

/// Mutual exclusion across pipeline instances
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Block until the lock for `key` is held, or fail after the acquire
    /// deadline passes
    async fn acquire(&self, key: &str) -> Result<LockToken>;

    async fn release(&self, token: LockToken) -> Result<()>;
}

/// SQLite-backed advisory mutex
pub struct SqliteMutex {
    db: Arc<SyncDatabase>,
    ttl_secs: i64,
    poll_interval: Duration,
    max_attempts: u32,
}

impl SqliteMutex {
    pub fn new(db: Arc<SyncDatabase>) -> Self {
        Self {
            db,
            ttl_secs: 60,
            poll_interval: Duration::from_millis(250),
            max_attempts: 120,
        }
    }

    #[cfg(test)]
    fn with_timing(db: Arc<SyncDatabase>, poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            db,
            ttl_secs: 60,
            poll_interval,
            max_attempts,
        }
    }
}

#[async_trait]
impl DistributedMutex for SqliteMutex {
    async fn acquire(&self, key: &str) -> Result<LockToken> {
        let token = Uuid::new_v4().to_string();

        for attempt in 0..self.max_attempts {
            if self.db.try_acquire_lock(key, &token, self.ttl_secs)? {
                return Ok(LockToken {
                    key: key.to_string(),
                    token,
                });
            }
            if attempt == 0 {
                warn!(key = %key, "Lock contended, waiting");
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(MailbriefError::Lock(format!(
            "Timed out acquiring lock for {}",
            key
        )))
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        self.db.release_lock(&token.key, &token.token)
    }
}
