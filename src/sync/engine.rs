//! Sync engine
//!
//! One `run_tick` call is one scheduler invocation: authenticate the
//! caller, sync every connected user in turn, hand enrichment work to
//! the background worker, then drain the archive outbox. A failing user
//! never blocks the others, and the cursor for a user only advances
//! after that user's discovered changes are safely persisted.

use flume::Sender;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::credentials::CredentialStore;
use crate::enrichment::worker::EnrichmentJob;
use crate::error::{MailbriefError, Result};
use crate::sync::archive::{ArchiveOutbox, ArchiveReport};
use crate::sync::classifier::ThreadClassifier;
use crate::sync::db::SyncDatabase;
use crate::sync::discovery::ChangeDiscovery;
use crate::sync::fetcher::ThreadFetcher;
use crate::token::AccessTokenProvider;

const PROVIDER: &str = "gmail";

/// Counters from one tick, for the scheduler log line
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub users_synced: usize,
    pub users_failed: usize,
    pub threads_persisted: usize,
    pub threads_skipped: usize,
    pub threads_fetch_failed: usize,
    pub threads_persist_failed: usize,
    /// Users whose stored cursor was rejected and fell back to a full scan
    pub cursor_fallbacks: usize,
    pub enrichment_dispatched: usize,
    pub archive: ArchiveReport,
}

/// Per-user result folded into the tick report
struct UserSyncResult {
    persisted: usize,
    skipped: usize,
    fetch_failed: usize,
    persist_failed: usize,
    cursor_fallback: bool,
    dispatched: usize,
}

pub struct SyncEngine {
    db: Arc<SyncDatabase>,
    store: Arc<CredentialStore>,
    tokens: Arc<dyn AccessTokenProvider>,
    discovery: ChangeDiscovery,
    fetcher: ThreadFetcher,
    classifier: ThreadClassifier,
    outbox: ArchiveOutbox,
    tick_secret: String,
    enrich_tx: Sender<EnrichmentJob>,
    worker_handle: JoinHandle<()>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SyncDatabase>,
        store: Arc<CredentialStore>,
        tokens: Arc<dyn AccessTokenProvider>,
        discovery: ChangeDiscovery,
        fetcher: ThreadFetcher,
        classifier: ThreadClassifier,
        outbox: ArchiveOutbox,
        tick_secret: String,
        enrich_tx: Sender<EnrichmentJob>,
        worker_handle: JoinHandle<()>,
    ) -> Self {
        Self {
            db,
            store,
            tokens,
            discovery,
            fetcher,
            classifier,
            outbox,
            tick_secret,
            enrich_tx,
            worker_handle,
        }
    }

    /// Run one sync tick. `secret` must match the configured scheduler
    /// secret.
    pub async fn run_tick(&self, secret: &str) -> Result<TickReport> {
        if secret != self.tick_secret {
            return Err(MailbriefError::Unauthorized(
                "Invalid tick secret".to_string(),
            ));
        }

        let mut report = TickReport::default();
        let users = self.store.list_for_provider(PROVIDER)?;
        info!(users = users.len(), "Tick started");

        for credential in &users {
            match self.sync_user(&credential.user_email).await {
                Ok(result) => {
                    report.users_synced += 1;
                    report.threads_persisted += result.persisted;
                    report.threads_skipped += result.skipped;
                    report.threads_fetch_failed += result.fetch_failed;
                    report.threads_persist_failed += result.persist_failed;
                    report.cursor_fallbacks += result.cursor_fallback as usize;
                    report.enrichment_dispatched += result.dispatched;
                }
                Err(err) => {
                    // One broken user must not take the tick down
                    error!(user = %credential.user_email, error = %err, "User sync failed");
                    report.users_failed += 1;
                }
            }
        }

        report.archive = self.outbox.drain().await?;

        info!(
            users_synced = report.users_synced,
            users_failed = report.users_failed,
            threads = report.threads_persisted,
            dispatched = report.enrichment_dispatched,
            archived = report.archive.completed,
            "Tick complete"
        );
        Ok(report)
    }

    async fn sync_user(&self, user_email: &str) -> Result<UserSyncResult> {
        let access_token = self.tokens.access_token(user_email, PROVIDER).await?;

        let credential = self
            .store
            .get(user_email, PROVIDER)?
            .ok_or_else(|| MailbriefError::Credential(format!("No credential for {}", user_email)))?;

        let discovery = self
            .discovery
            .discover(&access_token, credential.sync_cursor.as_deref())
            .await?;
        if discovery.cursor_invalidated {
            warn!(user = %user_email, "Stored cursor rejected, full scan ran instead");
        }

        let outcome = self.fetcher.fetch_all(&access_token, &discovery.thread_ids).await;

        let mut persisted = 0usize;
        let mut skipped = 0usize;
        let mut persist_failed = 0usize;
        let mut enrich_ids = Vec::new();
        for thread in &outcome.threads {
            match self.classifier.classify(user_email, thread) {
                Some(classified) => {
                    // Persist failures on one thread leave the rest intact
                    if let Err(err) = self
                        .db
                        .upsert_thread(&classified.thread)
                        .and_then(|_| self.db.upsert_messages(&classified.messages))
                    {
                        warn!(user = %user_email, thread = %thread.id, error = %err, "Persist failed");
                        persist_failed += 1;
                        continue;
                    }
                    persisted += 1;
                    // Calendar invites are persisted but never summarized
                    if !classified.thread.is_calendar_invite {
                        enrich_ids.push(thread.id.clone());
                    }
                }
                None => skipped += 1,
            }
        }

        // Threads that failed to fetch or persist stay undiscovered until
        // the next tick; advancing the cursor past them would lose their
        // changes, so it only moves when every discovered thread landed
        if outcome.failed.is_empty() && persist_failed == 0 {
            self.store
                .update_cursor(user_email, PROVIDER, &discovery.new_cursor)?;
        } else {
            warn!(
                user = %user_email,
                fetch_failed = outcome.failed.len(),
                persist_failed,
                "Thread failures, cursor not advanced"
            );
        }

        let dispatched = enrich_ids.len();
        if !enrich_ids.is_empty() {
            // Fire and forget: a closed channel only means the worker is
            // gone, which the tick does not care about
            let _ = self.enrich_tx.send(EnrichmentJob {
                user_email: user_email.to_string(),
                thread_ids: enrich_ids,
            });
        }

        Ok(UserSyncResult {
            persisted,
            skipped,
            fetch_failed: outcome.failed.len(),
            persist_failed,
            cursor_fallback: discovery.cursor_invalidated,
            dispatched,
        })
    }

    /// Close the enrichment channel and wait for the worker to drain it.
    /// Call after the last tick so queued jobs finish before exit.
    pub async fn shutdown(self) {
        drop(self.enrich_tx);
        if let Err(err) = self.worker_handle.await {
            error!(error = %err, "Enrichment worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrgConfig;
    use crate::credentials::Credential;
    use crate::encryption::TokenCipher;
    use crate::enrichment::llm::SummaryModel;
    use crate::enrichment::worker::EnrichmentWorker;
    use crate::provider::testing::{make_message, make_thread, FakeMailApi};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct StaticTokens;

    #[async_trait]
    impl AccessTokenProvider for StaticTokens {
        async fn access_token(&self, user_email: &str, _provider: &str) -> Result<String> {
            if user_email.starts_with("broken") {
                return Err(MailbriefError::Auth("invalid_grant".to_string()));
            }
            Ok("token".to_string())
        }
    }

    struct StaticModel;

    #[async_trait]
    impl SummaryModel for StaticModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(r#"{"summary": "Summarized.", "topic": "support", "status": "active"}"#.to_string())
        }

        fn fingerprint(&self) -> String {
            "static-0001".to_string()
        }
    }

    fn org() -> OrgConfig {
        OrgConfig {
            domain: "acme.dev".to_string(),
            support_address: "support@acme.dev".to_string(),
            onboarding_address: "onboarding@acme.dev".to_string(),
            skip_labels: vec![],
        }
    }

    fn seed_user(store: &CredentialStore, user: &str) {
        store
            .upsert(&Credential {
                user_email: user.to_string(),
                provider: "gmail".to_string(),
                refresh_token: "rt".to_string(),
                access_token: "at".to_string(),
                expires_at: Utc::now().timestamp() + 3600,
                sync_cursor: None,
            })
            .unwrap();
    }

    fn make_engine(api: Arc<FakeMailApi>) -> (SyncEngine, Arc<SyncDatabase>, Arc<CredentialStore>) {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        let store = Arc::new(CredentialStore::new(
            db.clone(),
            TokenCipher::new("test-secret").unwrap(),
        ));
        let tokens: Arc<dyn AccessTokenProvider> = Arc::new(StaticTokens);

        let (tx, rx) = flume::unbounded();
        let worker = EnrichmentWorker::new(db.clone(), Arc::new(StaticModel), 100);
        let handle = EnrichmentWorker::spawn(worker, rx);

        let engine = SyncEngine::new(
            db.clone(),
            store.clone(),
            tokens.clone(),
            ChangeDiscovery::new(api.clone(), &org(), 100),
            ThreadFetcher::with_timing(api.clone(), Duration::from_millis(1), Duration::from_millis(1)),
            ThreadClassifier::new(&org()),
            ArchiveOutbox::new(db.clone(), api, tokens, 50)
                .with_item_delay(Duration::from_millis(1)),
            "tick-secret".to_string(),
            tx,
            handle,
        );
        (engine, db, store)
    }

    fn seed_api_thread(api: &FakeMailApi, thread_id: &str) {
        api.put_thread(make_thread(
            thread_id,
            vec![make_message(
                &format!("m-{}", thread_id),
                thread_id,
                "customer@x.dev",
                "user@acme.dev",
                "Help with export",
                &["INBOX", "UNREAD"],
                1_714_000_000_000,
            )],
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_tick_secret() {
        let api = Arc::new(FakeMailApi::new("H100"));
        let (engine, _, _) = make_engine(api);
        let result = engine.run_tick("wrong").await;
        assert!(matches!(result, Err(MailbriefError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn first_then_incremental_sync_walks_the_cursor() {
        let api = Arc::new(FakeMailApi::new("H100"));
        seed_api_thread(&api, "t1");
        api.set_search_results(&[("m-t1", "t1")]);

        let (engine, db, store) = make_engine(api.clone());
        seed_user(&store, "user@acme.dev");

        // First tick: full scan, cursor lands on the head seen up front
        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.users_synced, 1);
        assert_eq!(report.threads_persisted, 1);
        let credential = store.get("user@acme.dev", "gmail").unwrap().unwrap();
        assert_eq!(credential.sync_cursor.as_deref(), Some("H100"));

        // Provider moves on: t2 arrives, head advances
        *api.profile_history_id.lock().unwrap() = "H105".to_string();
        seed_api_thread(&api, "t2");
        api.set_history("H100", &["t2"]);

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.threads_persisted, 1);
        let credential = store.get("user@acme.dev", "gmail").unwrap().unwrap();
        assert_eq!(credential.sync_cursor.as_deref(), Some("H105"));
        assert_eq!(db.count_threads("user@acme.dev").unwrap(), 2);
    }

    #[tokio::test]
    async fn rerunning_a_tick_is_idempotent() {
        let api = Arc::new(FakeMailApi::new("H100"));
        seed_api_thread(&api, "t1");
        api.set_search_results(&[("m-t1", "t1")]);
        api.set_history("H100", &["t1"]);

        let (engine, db, store) = make_engine(api);
        seed_user(&store, "user@acme.dev");

        engine.run_tick("tick-secret").await.unwrap();
        engine.run_tick("tick-secret").await.unwrap();

        assert_eq!(db.count_threads("user@acme.dev").unwrap(), 1);
        assert_eq!(db.count_messages("user@acme.dev").unwrap(), 1);
    }

    #[tokio::test]
    async fn one_broken_user_does_not_block_the_rest() {
        let api = Arc::new(FakeMailApi::new("H100"));
        seed_api_thread(&api, "t1");
        api.set_search_results(&[("m-t1", "t1")]);

        let (engine, _, store) = make_engine(api);
        seed_user(&store, "broken@acme.dev");
        seed_user(&store, "user@acme.dev");

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.users_failed, 1);
        assert_eq!(report.users_synced, 1);
        assert_eq!(report.threads_persisted, 1);
    }

    #[tokio::test]
    async fn fetch_failures_hold_the_cursor_back() {
        let api = Arc::new(FakeMailApi::new("H100"));
        api.set_search_results(&[("m-t1", "t1")]);
        // t1 is never fetchable: not stored in the fake, fails every attempt
        api.fail_thread_times("t1", 99);

        let (engine, _, store) = make_engine(api);
        seed_user(&store, "user@acme.dev");

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.threads_fetch_failed, 1);
        let credential = store.get("user@acme.dev", "gmail").unwrap().unwrap();
        assert!(credential.sync_cursor.is_none());
    }

    #[tokio::test]
    async fn persist_failures_hold_the_cursor_back() {
        let api = Arc::new(FakeMailApi::new("H100"));
        seed_api_thread(&api, "t1");
        api.set_search_results(&[("m-t1", "t1")]);

        let (engine, db, store) = make_engine(api);
        seed_user(&store, "user@acme.dev");
        db.fail_thread_upsert("t1");

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.threads_persist_failed, 1);
        assert_eq!(report.threads_persisted, 0);
        assert_eq!(report.enrichment_dispatched, 0);
        let credential = store.get("user@acme.dev", "gmail").unwrap().unwrap();
        assert!(credential.sync_cursor.is_none());

        // Once the write succeeds the thread lands and the cursor moves
        db.clear_thread_upsert_failures();
        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.threads_persisted, 1);
        let credential = store.get("user@acme.dev", "gmail").unwrap().unwrap();
        assert_eq!(credential.sync_cursor.as_deref(), Some("H100"));
    }

    #[tokio::test]
    async fn cursor_fallback_is_counted_in_the_report() {
        let api = Arc::new(FakeMailApi::new("H200"));
        api.invalidate_cursor("H100");
        seed_api_thread(&api, "t1");
        api.set_search_results(&[("m-t1", "t1")]);

        let (engine, _, store) = make_engine(api);
        seed_user(&store, "user@acme.dev");
        store.update_cursor("user@acme.dev", "gmail", "H100").unwrap();

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.cursor_fallbacks, 1);
        assert_eq!(report.threads_persisted, 1);
        let credential = store.get("user@acme.dev", "gmail").unwrap().unwrap();
        assert_eq!(credential.sync_cursor.as_deref(), Some("H200"));
    }

    #[tokio::test]
    async fn skip_labeled_threads_are_filtered_not_persisted() {
        let api = Arc::new(FakeMailApi::new("H100"));
        api.put_thread(make_thread(
            "t1",
            vec![make_message(
                "m1", "t1", "spammer@x.dev", "user@acme.dev", "Deal", &["SPAM"], 1,
            )],
        ));
        api.set_search_results(&[("m1", "t1")]);

        let (engine, db, store) = make_engine(api);
        seed_user(&store, "user@acme.dev");

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.threads_skipped, 1);
        assert_eq!(report.threads_persisted, 0);
        assert_eq!(db.count_threads("user@acme.dev").unwrap(), 0);
    }

    #[tokio::test]
    async fn tick_drains_the_archive_outbox() {
        let api = Arc::new(FakeMailApi::new("H100"));
        let (engine, db, store) = make_engine(api.clone());
        seed_user(&store, "user@acme.dev");
        db.enqueue_archive("user@acme.dev", "t9").unwrap();

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.archive.completed, 1);
        assert_eq!(api.modify_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_dispatched_enrichment() {
        let api = Arc::new(FakeMailApi::new("H100"));
        seed_api_thread(&api, "t1");
        api.set_search_results(&[("m-t1", "t1")]);

        let (engine, db, store) = make_engine(api);
        seed_user(&store, "user@acme.dev");

        let report = engine.run_tick("tick-secret").await.unwrap();
        assert_eq!(report.enrichment_dispatched, 1);
        engine.shutdown().await;

        let thread = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert_eq!(thread.summary.as_deref(), Some("Summarized."));
    }
}
