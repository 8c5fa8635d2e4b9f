//! Asynchronous enrichment worker
//!
//! The sync tick fires thread ids into a channel and moves on; this
//! worker drains the channel, checks the per-user quota and freshness
//! window, calls the model, validates the output, and writes the result
//! back. Enrichment failures never affect sync state.

use chrono::{Duration as ChronoDuration, Utc};
use flume::Receiver;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::enrichment::llm::{build_prompt, SummaryModel};
use crate::enrichment::schema::{extract_json, validate};
use crate::error::Result;
use crate::sync::classifier::Category;
use crate::sync::db::{EnrichmentUpdate, MessageRecord, SyncDatabase, ThreadRecord};

/// Usage action name for the daily summary quota
const USAGE_ACTION: &str = "generate_summary";
const QUOTA_WINDOW_HOURS: i64 = 24;

/// Threads summarized within this window are left alone
const FRESHNESS_WINDOW_HOURS: i64 = 1;

const MAX_TRANSCRIPT_MESSAGES: usize = 20;
const MAX_SNIPPET_CHARS: usize = 500;

/// One enrichment request, dispatched fire-and-forget from the tick
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub user_email: String,
    pub thread_ids: Vec<String>,
}

/// Per-thread result, mostly for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    Enriched,
    SkippedFresh,
    SkippedQuota,
    SkippedMissing,
    SkippedCalendarInvite,
    Failed(String),
}

pub struct EnrichmentWorker {
    db: Arc<SyncDatabase>,
    model: Arc<dyn SummaryModel>,
    daily_limit: i64,
}

impl EnrichmentWorker {
    pub fn new(db: Arc<SyncDatabase>, model: Arc<dyn SummaryModel>, daily_limit: i64) -> Self {
        Self {
            db,
            model,
            daily_limit,
        }
    }

    /// Run the worker until the job channel closes
    pub fn spawn(worker: EnrichmentWorker, rx: Receiver<EnrichmentJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(job) = rx.recv_async().await {
                worker.process_job(&job).await;
            }
            debug!("Enrichment worker shutting down");
        })
    }

    async fn process_job(&self, job: &EnrichmentJob) {
        let mut enriched = 0usize;
        for thread_id in &job.thread_ids {
            match self.enrich_thread(&job.user_email, thread_id).await {
                Ok(EnrichOutcome::Enriched) => enriched += 1,
                Ok(EnrichOutcome::SkippedQuota) => {
                    // The rest of the job is over quota too
                    info!(user = %job.user_email, "Daily summary quota reached, dropping job remainder");
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(user = %job.user_email, thread = %thread_id, error = %error, "Enrichment error");
                }
            }
        }
        debug!(
            user = %job.user_email,
            enriched,
            requested = job.thread_ids.len(),
            "Enrichment job done"
        );
    }

    /// Enrich a single thread end to end
    pub async fn enrich_thread(&self, user_email: &str, thread_id: &str) -> Result<EnrichOutcome> {
        if !self
            .db
            .check_rate_limit(user_email, USAGE_ACTION, self.daily_limit, QUOTA_WINDOW_HOURS)?
        {
            return Ok(EnrichOutcome::SkippedQuota);
        }

        let thread = match self.db.get_thread(user_email, thread_id)? {
            Some(thread) => thread,
            None => return Ok(EnrichOutcome::SkippedMissing),
        };

        // Invites are never enrichment-eligible, whatever dispatched them
        if thread.is_calendar_invite {
            return Ok(EnrichOutcome::SkippedCalendarInvite);
        }

        let cutoff = Utc::now() - ChronoDuration::hours(FRESHNESS_WINDOW_HOURS);
        if thread
            .summary_generated_at
            .is_some_and(|generated| generated >= cutoff)
        {
            return Ok(EnrichOutcome::SkippedFresh);
        }

        let messages = self.db.get_messages_for_thread(user_email, thread_id)?;
        let transcript = build_transcript(&thread, &messages);
        let category = Category::from_str(&thread.category);
        let prompt = build_prompt(category.as_str(), &transcript);

        let completion = match self.model.complete(&prompt).await {
            Ok(completion) => completion,
            Err(error) => return Ok(EnrichOutcome::Failed(error.to_string())),
        };

        let insights = match extract_json(&completion)
            .and_then(|value| validate(&value, category, thread.is_calendar_invite))
        {
            Ok(insights) => insights,
            Err(error) => {
                warn!(thread = %thread_id, error = %error, "Model output rejected");
                return Ok(EnrichOutcome::Failed(error.to_string()));
            }
        };

        let update = EnrichmentUpdate {
            summary: insights.summary,
            action_items: insights.action_items,
            ai_topic: insights.topic,
            ai_labels: insights.labels,
            satisfaction_score: insights.satisfaction_score,
            satisfaction_analysis: insights.satisfaction_analysis,
            is_escalation: insights.is_escalation,
            escalation_reason: insights.escalation_reason,
            escalation_type: insights.escalation_type,
            status: insights.status,
            is_billing: insights.is_billing,
            billing_status: insights.billing_status,
            enriched_by: self.model.fingerprint(),
        };

        // The cutoff travels into the UPDATE so a result racing a fresher
        // one loses at the database, not just at the check above
        if !self.db.update_enrichment(user_email, thread_id, &update, cutoff)? {
            return Ok(EnrichOutcome::SkippedFresh);
        }

        self.db.track_usage(user_email, USAGE_ACTION, 1)?;
        Ok(EnrichOutcome::Enriched)
    }
}

/// Render the last messages of a thread as prompt input, oldest first
fn build_transcript(thread: &ThreadRecord, messages: &[MessageRecord]) -> String {
    let start = messages.len().saturating_sub(MAX_TRANSCRIPT_MESSAGES);
    let mut out = format!(
        "Subject: {}\n\n",
        thread.subject.as_deref().unwrap_or("(no subject)")
    );
    for message in &messages[start..] {
        let when = message
            .timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown time".to_string());
        let snippet = truncate_chars(message.snippet.as_deref().unwrap_or(""), MAX_SNIPPET_CHARS);
        out.push_str(&format!("[{}] {}: {}\n", when, message.from_address, snippet));
    }
    out
}

fn truncate_chars(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        raw.to_string()
    } else {
        raw.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailbriefError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeModel {
        response: Mutex<String>,
        calls: AtomicU32,
        fail: bool,
    }

    impl FakeModel {
        fn returning(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(response.to_string()),
                calls: AtomicU32::new(0),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl SummaryModel for FakeModel {
        async fn complete(&self, _prompt: &str) -> crate::error::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MailbriefError::Network("model down".to_string()));
            }
            Ok(self.response.lock().unwrap().clone())
        }

        fn fingerprint(&self) -> String {
            "fake-0001".to_string()
        }
    }

    fn seed_thread(db: &SyncDatabase, thread_id: &str, category: &str) {
        use crate::sync::db::{MessageUpsert, ThreadUpsert};
        db.upsert_thread(&ThreadUpsert {
            user_email: "user@acme.dev".to_string(),
            provider_thread_id: thread_id.to_string(),
            subject: Some("Need help".to_string()),
            participants: vec![],
            directly_addressed: true,
            category: category.to_string(),
            labels: vec!["INBOX".to_string()],
            unread: true,
            has_attachments: false,
            message_count: 1,
            first_message_at: Some(Utc::now()),
            last_message_at: Some(Utc::now()),
            is_calendar_invite: false,
        })
        .unwrap();
        db.upsert_messages(&[MessageUpsert {
            user_email: "user@acme.dev".to_string(),
            provider_message_id: format!("m-{}", thread_id),
            provider_thread_id: thread_id.to_string(),
            subject: Some("Need help".to_string()),
            from_address: "customer@x.dev".to_string(),
            to_addresses: vec!["support@acme.dev".to_string()],
            cc_addresses: vec![],
            timestamp: Some(Utc::now()),
            snippet: Some("The export button does nothing".to_string()),
            labels: vec!["INBOX".to_string()],
            category: category.to_string(),
            unread: true,
            has_attachment: false,
        }])
        .unwrap();
    }

    const GOOD_RESPONSE: &str = r#"{
        "summary": "Customer reports the export button is broken.",
        "action_items": ["Reproduce the export bug"],
        "topic": "support",
        "labels": ["bug"],
        "satisfaction_score": 4,
        "is_escalation": false,
        "status": "active"
    }"#;

    #[tokio::test]
    async fn enriches_a_thread_and_tracks_usage() {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        seed_thread(&db, "t1", "support");
        let worker = EnrichmentWorker::new(db.clone(), FakeModel::returning(GOOD_RESPONSE), 100);

        let outcome = worker.enrich_thread("user@acme.dev", "t1").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Enriched);

        let thread = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert_eq!(
            thread.summary.as_deref(),
            Some("Customer reports the export button is broken.")
        );
        assert_eq!(thread.ai_topic.as_deref(), Some("support"));
        assert_eq!(thread.satisfaction_score, Some(4));
        assert_eq!(thread.enriched_by.as_deref(), Some("fake-0001"));

        let used = db
            .usage_total_since(
                "user@acme.dev",
                USAGE_ACTION,
                Utc::now() - ChronoDuration::hours(1),
            )
            .unwrap();
        assert_eq!(used, 1);
    }

    #[tokio::test]
    async fn fresh_summary_is_not_regenerated() {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        seed_thread(&db, "t1", "support");
        let model = FakeModel::returning(GOOD_RESPONSE);
        let worker = EnrichmentWorker::new(db.clone(), model.clone(), 100);

        worker.enrich_thread("user@acme.dev", "t1").await.unwrap();
        let outcome = worker.enrich_thread("user@acme.dev", "t1").await.unwrap();

        assert_eq!(outcome, EnrichOutcome::SkippedFresh);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quota_boundary_allows_the_last_unit_then_skips() {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        seed_thread(&db, "t1", "support");
        seed_thread(&db, "t2", "support");
        db.track_usage("user@acme.dev", USAGE_ACTION, 99).unwrap();

        let worker = EnrichmentWorker::new(db.clone(), FakeModel::returning(GOOD_RESPONSE), 100);

        // Unit 100 succeeds
        let outcome = worker.enrich_thread("user@acme.dev", "t1").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Enriched);

        // Unit 101 is skipped before any model call
        let outcome = worker.enrich_thread("user@acme.dev", "t2").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::SkippedQuota);
        let thread = db.get_thread("user@acme.dev", "t2").unwrap().unwrap();
        assert!(thread.summary.is_none());
    }

    #[tokio::test]
    async fn invalid_model_output_leaves_thread_and_quota_untouched() {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        seed_thread(&db, "t1", "support");
        let worker =
            EnrichmentWorker::new(db.clone(), FakeModel::returning("no json here at all"), 100);

        let outcome = worker.enrich_thread("user@acme.dev", "t1").await.unwrap();
        assert!(matches!(outcome, EnrichOutcome::Failed(_)));

        let thread = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert!(thread.summary.is_none());
        let used = db
            .usage_total_since(
                "user@acme.dev",
                USAGE_ACTION,
                Utc::now() - ChronoDuration::hours(1),
            )
            .unwrap();
        assert_eq!(used, 0);
    }

    #[tokio::test]
    async fn calendar_invites_are_never_summarized() {
        use crate::sync::db::ThreadUpsert;
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        db.upsert_thread(&ThreadUpsert {
            user_email: "user@acme.dev".to_string(),
            provider_thread_id: "t1".to_string(),
            subject: Some("Invitation: Standup".to_string()),
            participants: vec![],
            directly_addressed: true,
            category: "general".to_string(),
            labels: vec!["INBOX".to_string()],
            unread: true,
            has_attachments: false,
            message_count: 1,
            first_message_at: Some(Utc::now()),
            last_message_at: Some(Utc::now()),
            is_calendar_invite: true,
        })
        .unwrap();

        let model = FakeModel::returning(GOOD_RESPONSE);
        let worker = EnrichmentWorker::new(db.clone(), model.clone(), 100);
        let outcome = worker.enrich_thread("user@acme.dev", "t1").await.unwrap();

        assert_eq!(outcome, EnrichOutcome::SkippedCalendarInvite);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        let thread = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert!(thread.summary.is_none());
    }

    #[tokio::test]
    async fn unknown_thread_is_skipped() {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        let worker = EnrichmentWorker::new(db, FakeModel::returning(GOOD_RESPONSE), 100);
        let outcome = worker.enrich_thread("user@acme.dev", "ghost").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::SkippedMissing);
    }

    #[tokio::test]
    async fn worker_drains_channel_until_close() {
        let db = Arc::new(SyncDatabase::in_memory().unwrap());
        seed_thread(&db, "t1", "support");
        let worker = EnrichmentWorker::new(db.clone(), FakeModel::returning(GOOD_RESPONSE), 100);

        let (tx, rx) = flume::unbounded();
        let handle = EnrichmentWorker::spawn(worker, rx);
        tx.send(EnrichmentJob {
            user_email: "user@acme.dev".to_string(),
            thread_ids: vec!["t1".to_string()],
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let thread = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert!(thread.summary.is_some());
    }

    #[test]
    fn transcript_keeps_last_messages_and_truncates_snippets() {
        use crate::sync::db::MessageRecord;
        let thread = ThreadRecord {
            user_email: "u".into(),
            provider_thread_id: "t".into(),
            subject: Some("Long thread".into()),
            participants: vec![],
            directly_addressed: false,
            category: "general".into(),
            labels: vec![],
            unread: false,
            has_attachments: false,
            message_count: 25,
            first_message_at: None,
            last_message_at: None,
            is_calendar_invite: false,
            summary: None,
            action_items: vec![],
            ai_topic: None,
            ai_labels: vec![],
            satisfaction_score: None,
            satisfaction_analysis: None,
            is_escalation: false,
            escalation_reason: None,
            escalation_type: None,
            status: None,
            is_billing: false,
            billing_status: None,
            summary_generated_at: None,
            enriched_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let messages: Vec<MessageRecord> = (0..25)
            .map(|i| MessageRecord {
                user_email: "u".into(),
                provider_message_id: format!("m{}", i),
                provider_thread_id: "t".into(),
                subject: None,
                from_address: format!("sender{}@x.dev", i),
                to_addresses: vec![],
                cc_addresses: vec![],
                timestamp: None,
                snippet: Some("x".repeat(600)),
                labels: vec![],
                category: "general".into(),
                unread: false,
                has_attachment: false,
            })
            .collect();

        let transcript = build_transcript(&thread, &messages);
        // First five messages fall off the window
        assert!(!transcript.contains("sender4@x.dev"));
        assert!(transcript.contains("sender5@x.dev"));
        assert!(transcript.contains("sender24@x.dev"));
        // Snippets are capped
        assert!(!transcript.contains(&"x".repeat(501)));
        assert!(transcript.contains(&"x".repeat(500)));
    }
}
