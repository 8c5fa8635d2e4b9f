//! Mail provider REST client
//!
//! The `MailApi` trait is the seam between the sync pipeline and the
//! provider. The real implementation talks to the Gmail-style REST API;
//! tests substitute an in-memory fake.

pub mod types;

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{MailbriefError, Result};
use types::{GmailHistoryList, GmailProfile, GmailThread, MessageStub};

/// Provider operations the pipeline needs
#[async_trait]
pub trait MailApi: Send + Sync {
    /// Current mailbox profile, including the head of the change log
    async fn get_profile(&self, access_token: &str) -> Result<GmailProfile>;

    /// Search message ids matching a provider query, up to `max` results
    async fn search_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max: usize,
    ) -> Result<Vec<MessageStub>>;

    /// One page of the change log starting after `start_history_id`
    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<GmailHistoryList>;

    /// Full thread with all messages and payloads
    async fn get_thread(&self, access_token: &str, thread_id: &str) -> Result<GmailThread>;

    /// Add and remove labels on a thread
    async fn modify_thread_labels(
        &self,
        access_token: &str,
        thread_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<()>;
}

/// HTTP client for the Gmail REST API
pub struct GmailClient {
    client: reqwest::Client,
    base_url: String,
}

impl GmailClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(Self::DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailbriefError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        access_token: &str,
        url: &str,
        cursor_sensitive: bool,
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| MailbriefError::Network(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_error(status, &body, cursor_sensitive));
        }

        response
            .json()
            .await
            .map_err(|e| MailbriefError::Parse(format!("Invalid provider response: {}", e)))
    }

    /// Map an HTTP error status to a pipeline error. History requests are
    /// cursor-sensitive: a 404, or a 400 naming the history id, means the
    /// stored cursor aged out and discovery must fall back to a full scan.
    fn map_error(status: reqwest::StatusCode, body: &str, cursor_sensitive: bool) -> MailbriefError {
        use reqwest::StatusCode;
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                MailbriefError::Auth(format!("Provider rejected token ({}): {}", status, body))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                MailbriefError::RateLimited(format!("Provider rate limit: {}", body))
            }
            StatusCode::NOT_FOUND if cursor_sensitive => {
                MailbriefError::CursorInvalid(format!("History cursor expired: {}", body))
            }
            StatusCode::BAD_REQUEST if cursor_sensitive && body.contains("historyId") => {
                MailbriefError::CursorInvalid(format!("History cursor rejected: {}", body))
            }
            _ => MailbriefError::Network(format!("Provider error ({}): {}", status, body)),
        }
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn get_profile(&self, access_token: &str) -> Result<GmailProfile> {
        let url = format!("{}/users/me/profile", self.base_url);
        self.get_json(access_token, &url, false).await
    }

    async fn search_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max: usize,
    ) -> Result<Vec<MessageStub>> {
        let mut results: Vec<MessageStub> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page_size = (max - results.len()).min(100);
            let mut url = format!(
                "{}/users/me/messages?q={}&maxResults={}",
                self.base_url,
                urlencode(query),
                page_size
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", token));
            }

            let page: types::GmailMessageList = self.get_json(access_token, &url, false).await?;
            results.extend(page.messages);

            if results.len() >= max || page.next_page_token.is_none() {
                results.truncate(max);
                break;
            }
            page_token = page.next_page_token;
        }

        debug!(count = results.len(), "Message search complete");
        Ok(results)
    }

    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<GmailHistoryList> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}",
            self.base_url, start_history_id
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", token));
        }
        self.get_json(access_token, &url, true).await
    }

    async fn get_thread(&self, access_token: &str, thread_id: &str) -> Result<GmailThread> {
        let url = format!("{}/users/me/threads/{}?format=full", self.base_url, thread_id);
        self.get_json(access_token, &url, false).await
    }

    async fn modify_thread_labels(
        &self,
        access_token: &str,
        thread_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<()> {
        let url = format!("{}/users/me/threads/{}/modify", self.base_url, thread_id);
        let body = serde_json::json!({
            "addLabelIds": add,
            "removeLabelIds": remove,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| MailbriefError::Network(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_error(status, &body, false));
        }
        Ok(())
    }
}

/// Minimal query-string escaping for the search query parameter
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory provider fake shared by the sync and engine tests

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use types::{GmailMessage, HistoryMessageChange, HistoryRecord};

    #[derive(Default)]
    pub struct FakeMailApi {
        pub profile_history_id: Mutex<String>,
        /// start history id -> thread ids changed since then
        pub history: Mutex<HashMap<String, Vec<String>>>,
        /// cursors the provider no longer accepts
        pub invalid_cursors: Mutex<HashSet<String>>,
        /// message stubs returned by the full-scan search
        pub search_results: Mutex<Vec<MessageStub>>,
        /// queries passed to the full-scan search
        pub search_queries: Mutex<Vec<String>>,
        pub threads: Mutex<HashMap<String, GmailThread>>,
        /// thread id -> number of rate-limit failures before success
        pub thread_failures: Mutex<HashMap<String, u32>>,
        /// (thread id, added, removed) per modify call
        pub modify_calls: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
        pub modify_fail: Mutex<HashSet<String>>,
    }

    impl FakeMailApi {
        pub fn new(head_history_id: &str) -> Self {
            let fake = Self::default();
            *fake.profile_history_id.lock().unwrap() = head_history_id.to_string();
            fake
        }

        pub fn put_thread(&self, thread: GmailThread) {
            self.threads.lock().unwrap().insert(thread.id.clone(), thread);
        }

        pub fn set_history(&self, start: &str, thread_ids: &[&str]) {
            self.history.lock().unwrap().insert(
                start.to_string(),
                thread_ids.iter().map(|s| s.to_string()).collect(),
            );
        }

        pub fn invalidate_cursor(&self, cursor: &str) {
            self.invalid_cursors.lock().unwrap().insert(cursor.to_string());
        }

        pub fn set_search_results(&self, stubs: &[(&str, &str)]) {
            *self.search_results.lock().unwrap() = stubs
                .iter()
                .map(|(id, thread_id)| MessageStub {
                    id: id.to_string(),
                    thread_id: Some(thread_id.to_string()),
                })
                .collect();
        }

        pub fn fail_thread_times(&self, thread_id: &str, times: u32) {
            self.thread_failures
                .lock()
                .unwrap()
                .insert(thread_id.to_string(), times);
        }
    }

    /// Build a minimal thread with plain-text messages for fake responses
    pub fn make_thread(id: &str, messages: Vec<GmailMessage>) -> GmailThread {
        GmailThread {
            id: id.to_string(),
            messages,
        }
    }

    /// Deserialize a message from the handful of fields tests care about
    pub fn make_message(
        id: &str,
        thread_id: &str,
        from: &str,
        to: &str,
        subject: &str,
        labels: &[&str],
        internal_date_millis: i64,
    ) -> GmailMessage {
        let raw = serde_json::json!({
            "id": id,
            "threadId": thread_id,
            "labelIds": labels,
            "snippet": format!("snippet of {}", id),
            "internalDate": internal_date_millis.to_string(),
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "From", "value": from},
                    {"name": "To", "value": to},
                    {"name": "Subject", "value": subject},
                ],
            },
        });
        serde_json::from_value(raw).unwrap()
    }

    #[async_trait]
    impl MailApi for FakeMailApi {
        async fn get_profile(&self, _access_token: &str) -> Result<GmailProfile> {
            Ok(GmailProfile {
                email_address: "user@acme.dev".to_string(),
                history_id: self.profile_history_id.lock().unwrap().clone(),
            })
        }

        async fn search_message_ids(
            &self,
            _access_token: &str,
            query: &str,
            max: usize,
        ) -> Result<Vec<MessageStub>> {
            self.search_queries.lock().unwrap().push(query.to_string());
            let mut results = self.search_results.lock().unwrap().clone();
            results.truncate(max);
            Ok(results)
        }

        async fn list_history(
            &self,
            _access_token: &str,
            start_history_id: &str,
            _page_token: Option<&str>,
        ) -> Result<GmailHistoryList> {
            if self
                .invalid_cursors
                .lock()
                .unwrap()
                .contains(start_history_id)
            {
                return Err(MailbriefError::CursorInvalid(format!(
                    "cursor {} expired",
                    start_history_id
                )));
            }

            let thread_ids = self
                .history
                .lock()
                .unwrap()
                .get(start_history_id)
                .cloned()
                .unwrap_or_default();

            let history = thread_ids
                .iter()
                .enumerate()
                .map(|(i, thread_id)| HistoryRecord {
                    messages_added: vec![HistoryMessageChange {
                        message: MessageStub {
                            id: format!("h-{}", i),
                            thread_id: Some(thread_id.clone()),
                        },
                    }],
                    ..Default::default()
                })
                .collect();

            Ok(GmailHistoryList {
                history,
                history_id: Some(self.profile_history_id.lock().unwrap().clone()),
                next_page_token: None,
            })
        }

        async fn get_thread(&self, _access_token: &str, thread_id: &str) -> Result<GmailThread> {
            {
                let mut failures = self.thread_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(thread_id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(MailbriefError::RateLimited(format!(
                            "throttled fetching {}",
                            thread_id
                        )));
                    }
                }
            }
            self.threads
                .lock()
                .unwrap()
                .get(thread_id)
                .cloned()
                .ok_or_else(|| MailbriefError::Network(format!("thread {} not found", thread_id)))
        }

        async fn modify_thread_labels(
            &self,
            _access_token: &str,
            thread_id: &str,
            add: &[&str],
            remove: &[&str],
        ) -> Result<()> {
            if self.modify_fail.lock().unwrap().contains(thread_id) {
                return Err(MailbriefError::Network(format!(
                    "modify failed for {}",
                    thread_id
                )));
            }
            self.modify_calls.lock().unwrap().push((
                thread_id.to_string(),
                add.iter().map(|s| s.to_string()).collect(),
                remove.iter().map(|s| s.to_string()).collect(),
            ));
            Ok(())
        }
    }
}
