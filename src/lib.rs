//! mailbrief: mail synchronization and enrichment pipeline
//!
//! Pulls email for connected users from the provider's REST API,
//! reconstructs and classifies threads into a local SQLite database,
//! enriches them asynchronously with LLM-generated summaries, and
//! propagates archive actions back to the provider. Everything runs
//! inside a single externally-scheduled `run_tick` call; see
//! [`sync::engine::SyncEngine`].

pub mod config;
pub mod credentials;
pub mod encryption;
pub mod enrichment;
pub mod error;
pub mod lock;
pub mod oauth;
pub mod provider;
pub mod sync;
pub mod token;

pub use error::{MailbriefError, Result};
