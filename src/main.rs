//! Single-shot tick runner
//!
//! Intended to be invoked by an external scheduler (cron or similar):
//! runs one sync tick, waits for queued enrichment to drain, and exits.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailbrief::config::AppConfig;
use mailbrief::credentials::CredentialStore;
use mailbrief::encryption::TokenCipher;
use mailbrief::enrichment::llm::LlmClient;
use mailbrief::enrichment::worker::EnrichmentWorker;
use mailbrief::error::Result;
use mailbrief::lock::SqliteMutex;
use mailbrief::oauth::OAuthClient;
use mailbrief::provider::GmailClient;
use mailbrief::sync::archive::ArchiveOutbox;
use mailbrief::sync::classifier::ThreadClassifier;
use mailbrief::sync::db::SyncDatabase;
use mailbrief::sync::discovery::ChangeDiscovery;
use mailbrief::sync::engine::SyncEngine;
use mailbrief::sync::fetcher::ThreadFetcher;
use mailbrief::token::TokenManager;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mailbrief=debug,info")),
        )
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "Tick failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = match config_path_from_args() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_default()?,
    };

    let secret = std::env::var("MAILBRIEF_TICK_SECRET")
        .ok()
        .or_else(|| arg_value("--secret"))
        .unwrap_or_default();

    let timeout = Duration::from_secs(config.http_timeout_secs);

    let db = Arc::new(SyncDatabase::new(&config.database_path)?);
    let cipher = TokenCipher::new(&config.app_secret)?;
    let store = Arc::new(CredentialStore::new(db.clone(), cipher));
    let mutex = Arc::new(SqliteMutex::new(db.clone()));
    let oauth = Arc::new(OAuthClient::new(&config.oauth, timeout)?);
    let tokens = Arc::new(TokenManager::new(store.clone(), oauth, mutex));
    let api = Arc::new(GmailClient::new(timeout)?);

    let model = Arc::new(LlmClient::new(&config.llm, timeout)?);
    let (enrich_tx, enrich_rx) = flume::unbounded();
    let worker = EnrichmentWorker::new(db.clone(), model, config.limits.daily_summary_limit);
    let worker_handle = EnrichmentWorker::spawn(worker, enrich_rx);

    let engine = SyncEngine::new(
        db.clone(),
        store.clone(),
        tokens.clone(),
        ChangeDiscovery::new(api.clone(), &config.org, config.limits.first_sync_max_messages),
        ThreadFetcher::new(api.clone()),
        ThreadClassifier::new(&config.org),
        ArchiveOutbox::new(db, api, tokens, config.limits.archive_batch_limit),
        config.tick_secret.clone(),
        enrich_tx,
        worker_handle,
    );

    let report = engine.run_tick(&secret).await?;
    info!(
        users_synced = report.users_synced,
        users_failed = report.users_failed,
        threads_persisted = report.threads_persisted,
        threads_skipped = report.threads_skipped,
        fetch_failed = report.threads_fetch_failed,
        persist_failed = report.threads_persist_failed,
        cursor_fallbacks = report.cursor_fallbacks,
        enrichment_dispatched = report.enrichment_dispatched,
        archived = report.archive.completed,
        archive_failed = report.archive.failed,
        "Tick report"
    );

    // Let queued enrichment finish before the process exits
    engine.shutdown().await;
    Ok(())
}

fn config_path_from_args() -> Option<String> {
    std::env::var("MAILBRIEF_CONFIG").ok().or_else(|| arg_value("--config"))
}

fn arg_value(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}
