//! Change discovery
//!
//! Decides which threads changed since the last tick. A user with no
//! stored cursor gets a bounded full scan of the inbox; a user with a
//! cursor walks the provider change log from it. Either way the new
//! cursor is the change-log head captured from the profile BEFORE
//! enumeration, so changes landing mid-tick are picked up next time.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::OrgConfig;
use crate::error::{MailbriefError, Result};
use crate::provider::MailApi;

/// Exclusions for the first-sync full scan, mirroring the classifier's
/// skip labels so the bound is not wasted on messages that would be
/// filtered anyway
const FIRST_SYNC_EXCLUSIONS: &str =
    "-in:spam -in:trash -category:promotions -category:social -category:updates";

/// Query for the first-sync full scan: the inbox plus the routing
/// folders, since support/onboarding threads may already be archived
/// out of the inbox. Routing folder names come from the local part of
/// the configured routing addresses.
fn first_sync_query(org: &OrgConfig) -> String {
    let mut scopes = vec!["in:inbox".to_string()];
    for address in [&org.support_address, &org.onboarding_address] {
        if let Some(local) = address.split('@').next().filter(|l| !l.is_empty()) {
            scopes.push(format!("label:{}", local.to_lowercase()));
        }
    }
    format!("({}) {}", scopes.join(" OR "), FIRST_SYNC_EXCLUSIONS)
}

/// Outcome of one discovery pass
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Thread ids needing a fetch, deduplicated, in first-seen order
    pub thread_ids: Vec<String>,
    /// Cursor to persist once the discovered changes are stored
    pub new_cursor: String,
    /// True when the stored cursor was rejected and a full scan ran instead
    pub cursor_invalidated: bool,
}

pub struct ChangeDiscovery {
    api: Arc<dyn MailApi>,
    first_sync_query: String,
    first_sync_max_messages: usize,
}

impl ChangeDiscovery {
    pub fn new(api: Arc<dyn MailApi>, org: &OrgConfig, first_sync_max_messages: usize) -> Self {
        Self {
            api,
            first_sync_query: first_sync_query(org),
            first_sync_max_messages,
        }
    }

    /// Discover changed threads for a user. `cursor` is the stored sync
    /// cursor, absent on the first sync.
    pub async fn discover(&self, access_token: &str, cursor: Option<&str>) -> Result<Discovery> {
        // Head first, enumerate after: anything that lands in between is
        // re-discovered next tick rather than lost
        let profile = self.api.get_profile(access_token).await?;
        let new_cursor = profile.history_id;

        match cursor {
            None => {
                let thread_ids = self.full_scan(access_token).await?;
                info!(threads = thread_ids.len(), "First sync discovery complete");
                Ok(Discovery {
                    thread_ids,
                    new_cursor,
                    cursor_invalidated: false,
                })
            }
            Some(cursor) => match self.walk_history(access_token, cursor).await {
                Ok(thread_ids) => Ok(Discovery {
                    thread_ids,
                    new_cursor,
                    cursor_invalidated: false,
                }),
                Err(MailbriefError::CursorInvalid(reason)) => {
                    warn!(reason = %reason, "Sync cursor rejected, falling back to full scan");
                    let thread_ids = self.full_scan(access_token).await?;
                    Ok(Discovery {
                        thread_ids,
                        new_cursor,
                        cursor_invalidated: true,
                    })
                }
                Err(other) => Err(other),
            },
        }
    }

    async fn full_scan(&self, access_token: &str) -> Result<Vec<String>> {
        let stubs = self
            .api
            .search_message_ids(
                access_token,
                &self.first_sync_query,
                self.first_sync_max_messages,
            )
            .await?;

        let mut seen = HashSet::new();
        let mut thread_ids = Vec::new();
        for stub in stubs {
            // A stub without a thread id resolves to its own message id
            let thread_id = stub.thread_id.unwrap_or(stub.id);
            if seen.insert(thread_id.clone()) {
                thread_ids.push(thread_id);
            }
        }
        Ok(thread_ids)
    }

    async fn walk_history(&self, access_token: &str, cursor: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut thread_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .api
                .list_history(access_token, cursor, page_token.as_deref())
                .await?;

            for record in &page.history {
                for stub in record.touched_messages() {
                    let thread_id = stub
                        .thread_id
                        .clone()
                        .unwrap_or_else(|| stub.id.clone());
                    if seen.insert(thread_id.clone()) {
                        thread_ids.push(thread_id);
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!(threads = thread_ids.len(), "Incremental discovery complete");
        Ok(thread_ids)
    }
}
