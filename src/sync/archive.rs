//! Archive outbox
//!
//! Drains pending archive actions at the end of a tick, propagating each
//! one to the provider by removing the inbox label. Every item reaches a
//! terminal state exactly once; failed items are kept for inspection and
//! never retried automatically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::provider::MailApi;
use crate::sync::db::{ArchiveQueueItem, ArchiveStatus, SyncDatabase};
use crate::token::AccessTokenProvider;

const ITEM_DELAY: Duration = Duration::from_millis(250);
const PROVIDER: &str = "gmail";

/// Counts from one outbox drain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub completed: usize,
    pub failed: usize,
}

pub struct ArchiveOutbox {
    db: Arc<SyncDatabase>,
    api: Arc<dyn MailApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    batch_limit: usize,
    item_delay: Duration,
}

impl ArchiveOutbox {
    pub fn new(
        db: Arc<SyncDatabase>,
        api: Arc<dyn MailApi>,
        tokens: Arc<dyn AccessTokenProvider>,
        batch_limit: usize,
    ) -> Self {
        Self {
            db,
            api,
            tokens,
            batch_limit,
            item_delay: ITEM_DELAY,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    /// Process up to the batch limit of pending items, oldest first
    pub async fn drain(&self) -> crate::error::Result<ArchiveReport> {
        let pending = self.db.get_pending_archive(self.batch_limit)?;
        if pending.is_empty() {
            return Ok(ArchiveReport::default());
        }

        // One token fetch per user, not per item
        let mut by_user: HashMap<String, Vec<ArchiveQueueItem>> = HashMap::new();
        for item in pending {
            by_user.entry(item.user_email.clone()).or_default().push(item);
        }

        let mut report = ArchiveReport::default();
        for (user_email, items) in by_user {
            let access_token = match self.tokens.access_token(&user_email, PROVIDER).await {
                Ok(token) => token,
                Err(error) => {
                    // No token means none of this user's items can proceed
                    warn!(user = %user_email, error = %error, "Token unavailable, failing archive batch");
                    for item in &items {
                        self.db.mark_archive_terminal(
                            item.id,
                            ArchiveStatus::Failed,
                            Some(&error.to_string()),
                        )?;
                        report.failed += 1;
                    }
                    continue;
                }
            };

            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(self.item_delay).await;
                }

                match self
                    .api
                    .modify_thread_labels(&access_token, &item.provider_thread_id, &[], &["INBOX"])
                    .await
                {
                    Ok(()) => {
                        self.db
                            .mark_archive_terminal(item.id, ArchiveStatus::Completed, None)?;
                        report.completed += 1;
                    }
                    Err(error) => {
                        warn!(
                            user = %user_email,
                            thread = %item.provider_thread_id,
                            error = %error,
                            "Archive action failed"
                        );
                        self.db.mark_archive_terminal(
                            item.id,
                            ArchiveStatus::Failed,
                            Some(&error.to_string()),
                        )?;
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            "Archive outbox drained"
        );
        Ok(report)
    }
}
