//! LLM client for thread enrichment
//!
//! Talks to an OpenAI-compatible chat completions endpoint. The prompt
//! pins the output contract; validation of what comes back lives in the
//! schema module.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{MailbriefError, Result};

/// Prompt template. Placeholders: {category}, {transcript}
const SUMMARY_PROMPT: &str = r#"You are an assistant that summarizes email threads for a busy operator.

The thread below is categorized as: {category}

Respond with ONLY a JSON object, no prose, using exactly these fields:
{
  "summary": "2-3 sentence summary of the thread",
  "action_items": ["concrete follow-ups for the operator, empty if none"],
  "topic": "one of: support, onboarding, billing, sales, product, scheduling, internal, other",
  "labels": ["short lowercase tags"],
  "satisfaction_score": 1-10 or null,
  "satisfaction_analysis": "one sentence, only when a score is given",
  "is_escalation": true or false,
  "escalation_reason": "only when is_escalation is true",
  "escalation_type": "only when is_escalation is true",
  "status": "one of: active, waiting, resolved",
  "is_billing": true or false,
  "billing_status": "only when is_billing is true"
}

Thread transcript:
{transcript}"#;

/// Completion seam so the worker can be tested without HTTP
#[async_trait]
pub trait SummaryModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Identifier persisted alongside results to tell which model and
    /// prompt produced them
    fn fingerprint(&self) -> String;
}

/// Build the enrichment prompt for one thread
pub fn build_prompt(category: &str, transcript: &str) -> String {
    SUMMARY_PROMPT
        .replace("{category}", category)
        .replace("{transcript}", transcript)
}

/// Stable hash of the model name and prompt template
pub fn prompt_fingerprint(model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(SUMMARY_PROMPT.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailbriefError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SummaryModel for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MailbriefError::Network(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(MailbriefError::RateLimited("LLM rate limit".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailbriefError::Network(format!(
                "LLM error ({}): {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| MailbriefError::Parse(format!("Invalid LLM response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| MailbriefError::Parse("LLM returned no choices".to_string()))?;

        debug!(chars = content.len(), "LLM completion received");
        Ok(content)
    }

    fn fingerprint(&self) -> String {
        prompt_fingerprint(&self.model)
    }
}
