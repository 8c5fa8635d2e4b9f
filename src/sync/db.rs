//! SQLite persistence for the sync pipeline
//!
//! One database holds credentials, synced threads and messages, the
//! archive action queue, usage records for quota accounting, and the
//! advisory lock table. Thread and message upserts are idempotent:
//! re-running a tick with the same inputs changes nothing but the
//! `updated_at` timestamps. Enrichment columns are owned exclusively by
//! the enrichment worker and are never touched by the sync upsert path.

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MailbriefError, Result};

/// Database connection pool type
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Stored credential row. Token columns hold the encrypted envelopes;
/// the credential store is responsible for encryption and decryption.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub user_email: String,
    pub provider: String,
    pub encrypted_refresh_token: String,
    pub encrypted_access_token: String,
    /// Absolute access-token expiry (Unix seconds)
    pub expires_at: i64,
    /// Provider-native opaque change cursor (e.g. a Gmail history id)
    pub sync_cursor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One participant in a thread, with the internal/external split applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub email: String,
    pub name: Option<String>,
    pub internal: bool,
}

/// Sync-owned thread fields, recomputed from the full message set on
/// every upsert
#[derive(Debug, Clone)]
pub struct ThreadUpsert {
    pub user_email: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub participants: Vec<Participant>,
    pub directly_addressed: bool,
    pub category: String,
    pub labels: Vec<String>,
    pub unread: bool,
    pub has_attachments: bool,
    pub message_count: u32,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_calendar_invite: bool,
}

/// Full thread row, including the enrichment block
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub user_email: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub participants: Vec<Participant>,
    pub directly_addressed: bool,
    pub category: String,
    pub labels: Vec<String>,
    pub unread: bool,
    pub has_attachments: bool,
    pub message_count: u32,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_calendar_invite: bool,
    pub summary: Option<String>,
    pub action_items: Vec<String>,
    pub ai_topic: Option<String>,
    pub ai_labels: Vec<String>,
    pub satisfaction_score: Option<i64>,
    pub satisfaction_analysis: Option<String>,
    pub is_escalation: bool,
    pub escalation_reason: Option<String>,
    pub escalation_type: Option<String>,
    pub status: Option<String>,
    pub is_billing: bool,
    pub billing_status: Option<String>,
    pub summary_generated_at: Option<DateTime<Utc>>,
    pub enriched_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message upsert, keyed by (user, provider message id)
#[derive(Debug, Clone)]
pub struct MessageUpsert {
    pub user_email: String,
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub labels: Vec<String>,
    pub category: String,
    pub unread: bool,
    pub has_attachment: bool,
}

/// Stored message row
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub user_email: String,
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub labels: Vec<String>,
    pub category: String,
    pub unread: bool,
    pub has_attachment: bool,
}

/// Status of an archive queue item. `pending` transitions exactly once
/// into a terminal state; terminal items are kept for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveStatus {
    Pending,
    Completed,
    Failed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Queued provider-side archive action
#[derive(Debug, Clone)]
pub struct ArchiveQueueItem {
    pub id: i64,
    pub user_email: String,
    pub provider_thread_id: String,
    pub status: ArchiveStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Validated enrichment write-back payload
#[derive(Debug, Clone)]
pub struct EnrichmentUpdate {
    pub summary: String,
    pub action_items: Vec<String>,
    pub ai_topic: String,
    pub ai_labels: Vec<String>,
    pub satisfaction_score: Option<i64>,
    pub satisfaction_analysis: Option<String>,
    pub is_escalation: bool,
    pub escalation_reason: Option<String>,
    pub escalation_type: Option<String>,
    pub status: String,
    pub is_billing: bool,
    pub billing_status: Option<String>,
    pub enriched_by: String,
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| MailbriefError::Database(e.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(raw: Option<String>) -> Vec<T>
where
    Vec<T>: for<'de> Deserialize<'de>,
{
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// SQLite database for the sync pipeline
pub struct SyncDatabase {
    pool: DbPool,
    /// Thread ids whose upsert fails with a simulated write error
    #[cfg(test)]
    failing_thread_upserts: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl SyncDatabase {
    /// Create a new database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| MailbriefError::Database(format!("Failed to create pool: {}", e)))?;

        let db = Self {
            pool,
            #[cfg(test)]
            failing_thread_upserts: Default::default(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| MailbriefError::Database(format!("Failed to create pool: {}", e)))?;

        let db = Self {
            pool,
            #[cfg(test)]
            failing_thread_upserts: Default::default(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Make `upsert_thread` fail for a thread id, to exercise the
    /// persist-failure paths
    #[cfg(test)]
    pub(crate) fn fail_thread_upsert(&self, thread_id: &str) {
        self.failing_thread_upserts
            .lock()
            .unwrap()
            .insert(thread_id.to_string());
    }

    #[cfg(test)]
    pub(crate) fn clear_thread_upsert_failures(&self) {
        self.failing_thread_upserts.lock().unwrap().clear();
    }

    /// Get a connection from the pool
    pub fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| MailbriefError::Database(format!("Failed to get connection: {}", e)))
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;

        conn.execute_batch(
            r#"
            -- Enable foreign keys and WAL mode for better concurrency
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- OAuth credentials, one row per (user, provider)
            CREATE TABLE IF NOT EXISTS credentials (
                user_email TEXT NOT NULL,
                provider TEXT NOT NULL,
                encrypted_refresh_token TEXT NOT NULL,
                encrypted_access_token TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                sync_cursor TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_email, provider)
            );

            -- Synced conversation threads
            CREATE TABLE IF NOT EXISTS threads (
                user_email TEXT NOT NULL,
                provider_thread_id TEXT NOT NULL,
                subject TEXT,
                participants TEXT NOT NULL DEFAULT '[]',  -- JSON array
                directly_addressed INTEGER NOT NULL DEFAULT 0,
                category TEXT NOT NULL DEFAULT 'general',
                labels TEXT NOT NULL DEFAULT '[]',  -- JSON array
                unread INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                first_message_at TEXT,
                last_message_at TEXT,
                is_calendar_invite INTEGER NOT NULL DEFAULT 0,
                -- Enrichment block, written only by the enrichment worker
                summary TEXT,
                action_items TEXT NOT NULL DEFAULT '[]',  -- JSON array
                ai_topic TEXT,
                ai_labels TEXT NOT NULL DEFAULT '[]',  -- JSON array
                satisfaction_score INTEGER,
                satisfaction_analysis TEXT,
                is_escalation INTEGER NOT NULL DEFAULT 0,
                escalation_reason TEXT,
                escalation_type TEXT,
                status TEXT,
                is_billing INTEGER NOT NULL DEFAULT 0,
                billing_status TEXT,
                summary_generated_at TEXT,
                enriched_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_email, provider_thread_id)
            );

            CREATE INDEX IF NOT EXISTS idx_threads_last_message
                ON threads(user_email, last_message_at DESC);
            CREATE INDEX IF NOT EXISTS idx_threads_category
                ON threads(user_email, category);

            -- Individual messages within threads
            CREATE TABLE IF NOT EXISTS messages (
                user_email TEXT NOT NULL,
                provider_message_id TEXT NOT NULL,
                provider_thread_id TEXT NOT NULL,
                subject TEXT,
                from_address TEXT NOT NULL,
                to_addresses TEXT NOT NULL DEFAULT '[]',  -- JSON array
                cc_addresses TEXT NOT NULL DEFAULT '[]',  -- JSON array
                timestamp TEXT,
                snippet TEXT,
                labels TEXT NOT NULL DEFAULT '[]',  -- JSON array
                category TEXT NOT NULL DEFAULT 'general',
                unread INTEGER NOT NULL DEFAULT 0,
                has_attachment INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_email, provider_message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_thread
                ON messages(user_email, provider_thread_id);

            -- Outbox of pending provider-side archive actions.
            -- Rows are never deleted; terminal states are kept for audit.
            CREATE TABLE IF NOT EXISTS archive_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_email TEXT NOT NULL,
                provider_thread_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                processed_at TEXT,
                next_retry_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_archive_queue_status
                ON archive_queue(status, created_at);

            -- Append-only usage records for sliding-window quotas
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_email TEXT NOT NULL,
                action TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 1,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_usage_records_window
                ON usage_records(user_email, action, recorded_at);

            -- Advisory locks for serializing token refresh
            CREATE TABLE IF NOT EXISTS sync_locks (
                key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;

        Ok(())
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub fn upsert_credential(&self, row: &CredentialRow) -> Result<()> {
        let conn = self.connection()?;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO credentials (user_email, provider, encrypted_refresh_token,
                encrypted_access_token, expires_at, sync_cursor, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(user_email, provider) DO UPDATE SET
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                encrypted_access_token = excluded.encrypted_access_token,
                expires_at = excluded.expires_at,
                sync_cursor = excluded.sync_cursor,
                updated_at = excluded.updated_at",
            params![
                row.user_email,
                row.provider,
                row.encrypted_refresh_token,
                row.encrypted_access_token,
                row.expires_at,
                row.sync_cursor,
                now,
            ],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn get_credential(&self, user_email: &str, provider: &str) -> Result<Option<CredentialRow>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_email, provider, encrypted_refresh_token, encrypted_access_token,
                        expires_at, sync_cursor, created_at, updated_at
                 FROM credentials WHERE user_email = ?1 AND provider = ?2",
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;

        stmt.query_row(params![user_email, provider], Self::row_to_credential)
            .optional()
            .map_err(|e| MailbriefError::Database(e.to_string()))
    }

    pub fn list_credentials(&self, provider: &str) -> Result<Vec<CredentialRow>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_email, provider, encrypted_refresh_token, encrypted_access_token,
                        expires_at, sync_cursor, created_at, updated_at
                 FROM credentials WHERE provider = ?1 ORDER BY user_email ASC",
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![provider], Self::row_to_credential)
            .map_err(|e| MailbriefError::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn update_credential_tokens(
        &self,
        user_email: &str,
        provider: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: &str,
        expires_at: i64,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE credentials SET encrypted_access_token = ?1,
                encrypted_refresh_token = ?2, expires_at = ?3, updated_at = ?4
             WHERE user_email = ?5 AND provider = ?6",
            params![
                encrypted_access_token,
                encrypted_refresh_token,
                expires_at,
                to_ts(&Utc::now()),
                user_email,
                provider,
            ],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn update_sync_cursor(&self, user_email: &str, provider: &str, cursor: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE credentials SET sync_cursor = ?1, updated_at = ?2
             WHERE user_email = ?3 AND provider = ?4",
            params![cursor, to_ts(&Utc::now()), user_email, provider],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn delete_credential(&self, user_email: &str, provider: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM credentials WHERE user_email = ?1 AND provider = ?2",
            params![user_email, provider],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    fn row_to_credential(row: &Row) -> std::result::Result<CredentialRow, rusqlite::Error> {
        Ok(CredentialRow {
            user_email: row.get(0)?,
            provider: row.get(1)?,
            encrypted_refresh_token: row.get(2)?,
            encrypted_access_token: row.get(3)?,
            expires_at: row.get(4)?,
            sync_cursor: row.get(5)?,
            created_at: parse_ts(row.get::<_, Option<String>>(6)?).unwrap_or_else(Utc::now),
            updated_at: parse_ts(row.get::<_, Option<String>>(7)?).unwrap_or_else(Utc::now),
        })
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Idempotently upsert the sync-owned fields of a thread. Enrichment
    /// columns are left untouched so a re-sync never clobbers summaries.
    pub fn upsert_thread(&self, thread: &ThreadUpsert) -> Result<()> {
        #[cfg(test)]
        if self
            .failing_thread_upserts
            .lock()
            .unwrap()
            .contains(&thread.provider_thread_id)
        {
            return Err(MailbriefError::Database(format!(
                "simulated write failure for {}",
                thread.provider_thread_id
            )));
        }

        let conn = self.connection()?;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO threads (user_email, provider_thread_id, subject, participants,
                directly_addressed, category, labels, unread, has_attachments, message_count,
                first_message_at, last_message_at, is_calendar_invite, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
             ON CONFLICT(user_email, provider_thread_id) DO UPDATE SET
                subject = excluded.subject,
                participants = excluded.participants,
                directly_addressed = excluded.directly_addressed,
                category = excluded.category,
                labels = excluded.labels,
                unread = excluded.unread,
                has_attachments = excluded.has_attachments,
                message_count = excluded.message_count,
                first_message_at = excluded.first_message_at,
                last_message_at = excluded.last_message_at,
                is_calendar_invite = excluded.is_calendar_invite,
                updated_at = excluded.updated_at",
            params![
                thread.user_email,
                thread.provider_thread_id,
                thread.subject,
                encode_json(&thread.participants)?,
                thread.directly_addressed as i32,
                thread.category,
                encode_json(&thread.labels)?,
                thread.unread as i32,
                thread.has_attachments as i32,
                thread.message_count,
                thread.first_message_at.as_ref().map(to_ts),
                thread.last_message_at.as_ref().map(to_ts),
                thread.is_calendar_invite as i32,
                now,
            ],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn get_thread(&self, user_email: &str, thread_id: &str) -> Result<Option<ThreadRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_email, provider_thread_id, subject, participants, directly_addressed,
                        category, labels, unread, has_attachments, message_count,
                        first_message_at, last_message_at, is_calendar_invite,
                        summary, action_items, ai_topic, ai_labels, satisfaction_score,
                        satisfaction_analysis, is_escalation, escalation_reason, escalation_type,
                        status, is_billing, billing_status, summary_generated_at, enriched_by,
                        created_at, updated_at
                 FROM threads WHERE user_email = ?1 AND provider_thread_id = ?2",
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;

        stmt.query_row(params![user_email, thread_id], Self::row_to_thread)
            .optional()
            .map_err(|e| MailbriefError::Database(e.to_string()))
    }

    pub fn count_threads(&self, user_email: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE user_email = ?1",
            params![user_email],
            |row| row.get(0),
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))
    }

    /// Apply a validated enrichment result. The freshness guard is
    /// enforced here as well as in the worker: an existing summary
    /// younger than `cutoff` wins and the update is a no-op.
    pub fn update_enrichment(
        &self,
        user_email: &str,
        thread_id: &str,
        update: &EnrichmentUpdate,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.connection()?;
        let now = to_ts(&Utc::now());
        let changed = conn
            .execute(
                "UPDATE threads SET
                    summary = ?1, action_items = ?2, ai_topic = ?3, ai_labels = ?4,
                    satisfaction_score = ?5, satisfaction_analysis = ?6,
                    is_escalation = ?7, escalation_reason = ?8, escalation_type = ?9,
                    status = ?10, is_billing = ?11, billing_status = ?12,
                    summary_generated_at = ?13, enriched_by = ?14, updated_at = ?13
                 WHERE user_email = ?15 AND provider_thread_id = ?16
                   AND (summary_generated_at IS NULL OR summary_generated_at < ?17)",
                params![
                    update.summary,
                    encode_json(&update.action_items)?,
                    update.ai_topic,
                    encode_json(&update.ai_labels)?,
                    update.satisfaction_score,
                    update.satisfaction_analysis,
                    update.is_escalation as i32,
                    update.escalation_reason,
                    update.escalation_type,
                    update.status,
                    update.is_billing as i32,
                    update.billing_status,
                    now,
                    update.enriched_by,
                    user_email,
                    thread_id,
                    to_ts(&cutoff),
                ],
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(changed > 0)
    }

    fn row_to_thread(row: &Row) -> std::result::Result<ThreadRecord, rusqlite::Error> {
        Ok(ThreadRecord {
            user_email: row.get(0)?,
            provider_thread_id: row.get(1)?,
            subject: row.get(2)?,
            participants: decode_json(row.get::<_, Option<String>>(3)?),
            directly_addressed: row.get::<_, i32>(4)? != 0,
            category: row.get(5)?,
            labels: decode_json(row.get::<_, Option<String>>(6)?),
            unread: row.get::<_, i32>(7)? != 0,
            has_attachments: row.get::<_, i32>(8)? != 0,
            message_count: row.get(9)?,
            first_message_at: parse_ts(row.get::<_, Option<String>>(10)?),
            last_message_at: parse_ts(row.get::<_, Option<String>>(11)?),
            is_calendar_invite: row.get::<_, i32>(12)? != 0,
            summary: row.get(13)?,
            action_items: decode_json(row.get::<_, Option<String>>(14)?),
            ai_topic: row.get(15)?,
            ai_labels: decode_json(row.get::<_, Option<String>>(16)?),
            satisfaction_score: row.get(17)?,
            satisfaction_analysis: row.get(18)?,
            is_escalation: row.get::<_, i32>(19)? != 0,
            escalation_reason: row.get(20)?,
            escalation_type: row.get(21)?,
            status: row.get(22)?,
            is_billing: row.get::<_, i32>(23)? != 0,
            billing_status: row.get(24)?,
            summary_generated_at: parse_ts(row.get::<_, Option<String>>(25)?),
            enriched_by: row.get(26)?,
            created_at: parse_ts(row.get::<_, Option<String>>(27)?).unwrap_or_else(Utc::now),
            updated_at: parse_ts(row.get::<_, Option<String>>(28)?).unwrap_or_else(Utc::now),
        })
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Upsert a batch of messages in one transaction
    pub fn upsert_messages(&self, messages: &[MessageUpsert]) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| MailbriefError::Database(e.to_string()))?;
        let now = to_ts(&Utc::now());

        for message in messages {
            tx.execute(
                "INSERT INTO messages (user_email, provider_message_id, provider_thread_id,
                    subject, from_address, to_addresses, cc_addresses, timestamp, snippet,
                    labels, category, unread, has_attachment, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                 ON CONFLICT(user_email, provider_message_id) DO UPDATE SET
                    subject = excluded.subject,
                    labels = excluded.labels,
                    category = excluded.category,
                    unread = excluded.unread,
                    has_attachment = excluded.has_attachment,
                    updated_at = excluded.updated_at",
                params![
                    message.user_email,
                    message.provider_message_id,
                    message.provider_thread_id,
                    message.subject,
                    message.from_address,
                    encode_json(&message.to_addresses)?,
                    encode_json(&message.cc_addresses)?,
                    message.timestamp.as_ref().map(to_ts),
                    message.snippet,
                    encode_json(&message.labels)?,
                    message.category,
                    message.unread as i32,
                    message.has_attachment as i32,
                    now,
                ],
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;
        }

        tx.commit().map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get all messages for a thread in chronological order
    pub fn get_messages_for_thread(
        &self,
        user_email: &str,
        thread_id: &str,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_email, provider_message_id, provider_thread_id, subject,
                        from_address, to_addresses, cc_addresses, timestamp, snippet,
                        labels, category, unread, has_attachment
                 FROM messages WHERE user_email = ?1 AND provider_thread_id = ?2
                 ORDER BY timestamp ASC",
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![user_email, thread_id], Self::row_to_message)
            .map_err(|e| MailbriefError::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn count_messages(&self, user_email: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_email = ?1",
            params![user_email],
            |row| row.get(0),
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))
    }

    fn row_to_message(row: &Row) -> std::result::Result<MessageRecord, rusqlite::Error> {
        Ok(MessageRecord {
            user_email: row.get(0)?,
            provider_message_id: row.get(1)?,
            provider_thread_id: row.get(2)?,
            subject: row.get(3)?,
            from_address: row.get(4)?,
            to_addresses: decode_json(row.get::<_, Option<String>>(5)?),
            cc_addresses: decode_json(row.get::<_, Option<String>>(6)?),
            timestamp: parse_ts(row.get::<_, Option<String>>(7)?),
            snippet: row.get(8)?,
            labels: decode_json(row.get::<_, Option<String>>(9)?),
            category: row.get(10)?,
            unread: row.get::<_, i32>(11)? != 0,
            has_attachment: row.get::<_, i32>(12)? != 0,
        })
    }

    // ========================================================================
    // Archive queue
    // ========================================================================

    /// Enqueue a pending archive action (producer side, called by the UI)
    pub fn enqueue_archive(&self, user_email: &str, thread_id: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO archive_queue (user_email, provider_thread_id, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![user_email, thread_id, to_ts(&Utc::now())],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Get pending archive items in creation order, up to `limit`
    pub fn get_pending_archive(&self, limit: usize) -> Result<Vec<ArchiveQueueItem>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_email, provider_thread_id, status, attempts, last_error,
                        created_at, processed_at, next_retry_at
                 FROM archive_queue WHERE status = 'pending'
                 ORDER BY created_at ASC LIMIT ?1",
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;

        let items = stmt
            .query_map(params![limit as i64], Self::row_to_archive_item)
            .map_err(|e| MailbriefError::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    pub fn get_archive_item(&self, id: i64) -> Result<Option<ArchiveQueueItem>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_email, provider_thread_id, status, attempts, last_error,
                        created_at, processed_at, next_retry_at
                 FROM archive_queue WHERE id = ?1",
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;

        stmt.query_row(params![id], Self::row_to_archive_item)
            .optional()
            .map_err(|e| MailbriefError::Database(e.to_string()))
    }

    /// Mark an archive item terminal. Only pending items transition, so a
    /// completed or failed item can never change state again.
    pub fn mark_archive_terminal(
        &self,
        id: i64,
        status: ArchiveStatus,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status != ArchiveStatus::Pending);
        let conn = self.connection()?;
        conn.execute(
            "UPDATE archive_queue SET status = ?1, last_error = ?2,
                attempts = attempts + 1, processed_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![status.as_str(), error, to_ts(&Utc::now()), id],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    fn row_to_archive_item(row: &Row) -> std::result::Result<ArchiveQueueItem, rusqlite::Error> {
        Ok(ArchiveQueueItem {
            id: row.get(0)?,
            user_email: row.get(1)?,
            provider_thread_id: row.get(2)?,
            status: ArchiveStatus::from_str(&row.get::<_, String>(3)?),
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            created_at: parse_ts(row.get::<_, Option<String>>(6)?).unwrap_or_else(Utc::now),
            processed_at: parse_ts(row.get::<_, Option<String>>(7)?),
            next_retry_at: parse_ts(row.get::<_, Option<String>>(8)?),
        })
    }

    // ========================================================================
    // Usage records / quota
    // ========================================================================

    /// Record usage units against an action (append-only)
    pub fn track_usage(&self, user_email: &str, action: &str, count: i64) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO usage_records (user_email, action, count, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_email, action, count, to_ts(&Utc::now())],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }

    /// Total usage units for an action since `since`
    pub fn usage_total_since(
        &self,
        user_email: &str,
        action: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM usage_records
             WHERE user_email = ?1 AND action = ?2 AND recorded_at >= ?3",
            params![user_email, action, to_ts(&since)],
            |row| row.get(0),
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))
    }

    /// True if the user is still under `limit` for `action` within the
    /// sliding window
    pub fn check_rate_limit(
        &self,
        user_email: &str,
        action: &str,
        limit: i64,
        window_hours: i64,
    ) -> Result<bool> {
        let since = Utc::now() - chrono::Duration::hours(window_hours);
        let total = self.usage_total_since(user_email, action, since)?;
        Ok(total < limit)
    }

    // ========================================================================
    // Advisory locks
    // ========================================================================

    /// Try to take the advisory lock for `key`. Succeeds if the key is
    /// free or its previous holder expired.
    pub fn try_acquire_lock(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool> {
        let conn = self.connection()?;
        let now = Utc::now().timestamp();
        let changed = conn
            .execute(
                "INSERT INTO sync_locks (key, token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    token = excluded.token,
                    expires_at = excluded.expires_at
                 WHERE sync_locks.expires_at <= ?4",
                params![key, token, now + ttl_secs, now],
            )
            .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Release a lock. A stale token (lock already taken over) is a no-op.
    pub fn release_lock(&self, key: &str, token: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM sync_locks WHERE key = ?1 AND token = ?2",
            params![key, token],
        )
        .map_err(|e| MailbriefError::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_thread(user: &str, id: &str) -> ThreadUpsert {
        ThreadUpsert {
            user_email: user.to_string(),
            provider_thread_id: id.to_string(),
            subject: Some("Payment issue".to_string()),
            participants: vec![Participant {
                email: "customer@example.com".to_string(),
                name: Some("Customer".to_string()),
                internal: false,
            }],
            directly_addressed: true,
            category: "support".to_string(),
            labels: vec!["INBOX".to_string(), "UNREAD".to_string()],
            unread: true,
            has_attachments: false,
            message_count: 2,
            first_message_at: Some(Utc::now() - chrono::Duration::hours(2)),
            last_message_at: Some(Utc::now()),
            is_calendar_invite: false,
        }
    }

    fn sample_message(user: &str, msg_id: &str, thread_id: &str) -> MessageUpsert {
        MessageUpsert {
            user_email: user.to_string(),
            provider_message_id: msg_id.to_string(),
            provider_thread_id: thread_id.to_string(),
            subject: Some("Payment issue".to_string()),
            from_address: "customer@example.com".to_string(),
            to_addresses: vec!["support@acme.dev".to_string()],
            cc_addresses: vec![],
            timestamp: Some(Utc::now()),
            snippet: Some("My card was declined".to_string()),
            labels: vec!["INBOX".to_string()],
            category: "support".to_string(),
            unread: true,
            has_attachment: false,
        }
    }

    #[test]
    fn thread_upsert_is_idempotent() {
        let db = SyncDatabase::in_memory().unwrap();
        let thread = sample_thread("user@acme.dev", "t1");

        db.upsert_thread(&thread).unwrap();
        db.upsert_thread(&thread).unwrap();

        assert_eq!(db.count_threads("user@acme.dev").unwrap(), 1);
        let stored = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert_eq!(stored.category, "support");
        assert_eq!(stored.message_count, 2);
    }

    #[test]
    fn thread_upsert_preserves_enrichment() {
        let db = SyncDatabase::in_memory().unwrap();
        let thread = sample_thread("user@acme.dev", "t1");
        db.upsert_thread(&thread).unwrap();

        let update = EnrichmentUpdate {
            summary: "Customer's card was declined twice.".to_string(),
            action_items: vec!["Refund the duplicate charge".to_string()],
            ai_topic: "billing".to_string(),
            ai_labels: vec!["payments".to_string()],
            satisfaction_score: Some(4),
            satisfaction_analysis: None,
            is_escalation: false,
            escalation_reason: None,
            escalation_type: None,
            status: "active".to_string(),
            is_billing: true,
            billing_status: Some("disputed".to_string()),
            enriched_by: "abc123".to_string(),
        };
        assert!(db
            .update_enrichment("user@acme.dev", "t1", &update, Utc::now())
            .unwrap());

        // Re-sync must not clobber the enrichment block
        db.upsert_thread(&thread).unwrap();
        let stored = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert_eq!(
            stored.summary.as_deref(),
            Some("Customer's card was declined twice.")
        );
        assert_eq!(stored.ai_topic.as_deref(), Some("billing"));
        assert!(stored.summary_generated_at.is_some());
    }

    #[test]
    fn enrichment_freshness_guard_blocks_young_summaries() {
        let db = SyncDatabase::in_memory().unwrap();
        db.upsert_thread(&sample_thread("user@acme.dev", "t1")).unwrap();

        let update = EnrichmentUpdate {
            summary: "First summary".to_string(),
            action_items: vec![],
            ai_topic: "other".to_string(),
            ai_labels: vec![],
            satisfaction_score: None,
            satisfaction_analysis: None,
            is_escalation: false,
            escalation_reason: None,
            escalation_type: None,
            status: "active".to_string(),
            is_billing: false,
            billing_status: None,
            enriched_by: "abc123".to_string(),
        };
        assert!(db
            .update_enrichment("user@acme.dev", "t1", &update, Utc::now())
            .unwrap());

        // A second write with a cutoff one hour in the past must lose to
        // the just-written summary.
        let mut second = update.clone();
        second.summary = "Second summary".to_string();
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert!(!db
            .update_enrichment("user@acme.dev", "t1", &second, cutoff)
            .unwrap());

        let stored = db.get_thread("user@acme.dev", "t1").unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("First summary"));
    }

    #[test]
    fn message_upsert_is_idempotent() {
        let db = SyncDatabase::in_memory().unwrap();
        let messages = vec![
            sample_message("user@acme.dev", "m1", "t1"),
            sample_message("user@acme.dev", "m2", "t1"),
        ];
        db.upsert_messages(&messages).unwrap();
        db.upsert_messages(&messages).unwrap();

        assert_eq!(db.count_messages("user@acme.dev").unwrap(), 2);
        let stored = db.get_messages_for_thread("user@acme.dev", "t1").unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn archive_item_transitions_exactly_once() {
        let db = SyncDatabase::in_memory().unwrap();
        let id = db.enqueue_archive("user@acme.dev", "t1").unwrap();

        db.mark_archive_terminal(id, ArchiveStatus::Completed, None)
            .unwrap();
        // A later failure attempt must not revert the terminal state
        db.mark_archive_terminal(id, ArchiveStatus::Failed, Some("late error"))
            .unwrap();

        let item = db.get_archive_item(id).unwrap().unwrap();
        assert_eq!(item.status, ArchiveStatus::Completed);
        assert_eq!(item.attempts, 1);
        assert!(item.processed_at.is_some());
    }

    #[test]
    fn pending_archive_respects_limit_and_order() {
        let db = SyncDatabase::in_memory().unwrap();
        for i in 0..5 {
            db.enqueue_archive("user@acme.dev", &format!("t{}", i)).unwrap();
        }
        let items = db.get_pending_archive(3).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].provider_thread_id, "t0");
    }

    #[test]
    fn usage_window_counts_sum_of_units() {
        let db = SyncDatabase::in_memory().unwrap();
        db.track_usage("user@acme.dev", "generate_summary", 99).unwrap();
        assert!(db
            .check_rate_limit("user@acme.dev", "generate_summary", 100, 24)
            .unwrap());

        db.track_usage("user@acme.dev", "generate_summary", 1).unwrap();
        assert!(!db
            .check_rate_limit("user@acme.dev", "generate_summary", 100, 24)
            .unwrap());
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let db = SyncDatabase::in_memory().unwrap();
        assert!(db.try_acquire_lock("token:u:gmail", "a", 60).unwrap());
        assert!(!db.try_acquire_lock("token:u:gmail", "b", 60).unwrap());

        db.release_lock("token:u:gmail", "a").unwrap();
        assert!(db.try_acquire_lock("token:u:gmail", "b", 60).unwrap());
    }

    #[test]
    fn expired_lock_can_be_taken_over() {
        let db = SyncDatabase::in_memory().unwrap();
        assert!(db.try_acquire_lock("token:u:gmail", "a", -1).unwrap());
        assert!(db.try_acquire_lock("token:u:gmail", "b", 60).unwrap());
        // The original holder's release must not free the new holder's lock
        db.release_lock("token:u:gmail", "a").unwrap();
        assert!(!db.try_acquire_lock("token:u:gmail", "c", 60).unwrap());
    }

    #[test]
    fn file_backed_database_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailbrief.db");

        let db = SyncDatabase::new(&path).unwrap();
        db.upsert_thread(&sample_thread("user@acme.dev", "t1")).unwrap();

        drop(db);
        let reopened = SyncDatabase::new(&path).unwrap();
        assert_eq!(reopened.count_threads("user@acme.dev").unwrap(), 1);
    }

    #[test]
    fn credential_round_trip() {
        let db = SyncDatabase::in_memory().unwrap();
        let row = CredentialRow {
            user_email: "user@acme.dev".to_string(),
            provider: "gmail".to_string(),
            encrypted_refresh_token: "enc-refresh".to_string(),
            encrypted_access_token: "enc-access".to_string(),
            expires_at: 1_700_000_000,
            sync_cursor: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.upsert_credential(&row).unwrap();
        db.update_sync_cursor("user@acme.dev", "gmail", "H100").unwrap();

        let stored = db.get_credential("user@acme.dev", "gmail").unwrap().unwrap();
        assert_eq!(stored.sync_cursor.as_deref(), Some("H100"));
        assert_eq!(db.list_credentials("gmail").unwrap().len(), 1);
    }
}
