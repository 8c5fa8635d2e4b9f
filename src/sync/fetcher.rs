//! Thread fetcher
//!
//! Pulls full threads from the provider in small concurrent batches with
//! a pause between batches, retrying transient failures per thread. A
//! thread that exhausts its attempts is reported, not fatal; the rest of
//! the batch proceeds.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MailbriefError, Result};
use crate::provider::types::GmailThread;
use crate::provider::MailApi;

const BATCH_SIZE: usize = 5;
const BATCH_DELAY: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Result of fetching a set of thread ids
#[derive(Debug)]
pub struct FetchOutcome {
    pub threads: Vec<GmailThread>,
    /// Thread ids that failed all attempts, with their final error
    pub failed: Vec<(String, MailbriefError)>,
}

pub struct ThreadFetcher {
    api: Arc<dyn MailApi>,
    batch_delay: Duration,
    backoff_base: Duration,
}

impl ThreadFetcher {
    pub fn new(api: Arc<dyn MailApi>) -> Self {
        Self {
            api,
            batch_delay: BATCH_DELAY,
            backoff_base: BACKOFF_BASE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_timing(
        api: Arc<dyn MailApi>,
        batch_delay: Duration,
        backoff_base: Duration,
    ) -> Self {
        Self {
            api,
            batch_delay,
            backoff_base,
        }
    }

    /// Fetch all listed threads, batched
    pub async fn fetch_all(&self, access_token: &str, thread_ids: &[String]) -> FetchOutcome {
        let mut threads = Vec::with_capacity(thread_ids.len());
        let mut failed = Vec::new();

        for (batch_index, batch) in thread_ids.chunks(BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }

            let fetches = batch
                .iter()
                .map(|thread_id| self.fetch_with_retry(access_token, thread_id));
            for (thread_id, result) in batch.iter().zip(join_all(fetches).await) {
                match result {
                    Ok(thread) => threads.push(thread),
                    Err(error) => {
                        warn!(thread = %thread_id, error = %error, "Thread fetch failed");
                        failed.push((thread_id.clone(), error));
                    }
                }
            }
        }

        debug!(
            fetched = threads.len(),
            failed = failed.len(),
            "Thread fetch complete"
        );
        FetchOutcome { threads, failed }
    }

    async fn fetch_with_retry(&self, access_token: &str, thread_id: &str) -> Result<GmailThread> {
        let mut delay = self.backoff_base;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.api.get_thread(access_token, thread_id).await {
                Ok(thread) => return Ok(thread),
                Err(error) if error.is_retryable() && attempt < MAX_ATTEMPTS => {
                    debug!(
                        thread = %thread_id,
                        attempt,
                        "Retryable fetch error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
