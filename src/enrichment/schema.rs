//! LLM output validation
//!
//! Model output is untrusted. The raw completion text is stripped down to
//! its JSON object, then validated field by field: a missing summary
//! rejects the whole result, everything else degrades to a safe default.

use serde_json::Value;

use crate::error::{MailbriefError, Result};
use crate::sync::classifier::Category;

/// Topics the model may assign; anything else becomes "other"
const ALLOWED_TOPICS: &[&str] = &[
    "support",
    "onboarding",
    "billing",
    "sales",
    "product",
    "scheduling",
    "internal",
    "other",
];

const ALLOWED_STATUSES: &[&str] = &["active", "waiting", "resolved"];

/// Validated enrichment fields for one thread
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInsights {
    pub summary: String,
    pub action_items: Vec<String>,
    pub topic: String,
    pub labels: Vec<String>,
    pub satisfaction_score: Option<i64>,
    pub satisfaction_analysis: Option<String>,
    pub is_escalation: bool,
    pub escalation_reason: Option<String>,
    pub escalation_type: Option<String>,
    pub status: String,
    pub is_billing: bool,
    pub billing_status: Option<String>,
}

/// Pull the JSON object out of a completion that may wrap it in markdown
/// fences or prose
pub fn extract_json(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();

    // Fenced block first
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if let Ok(value) = serde_json::from_str(inner) {
                return Ok(value);
            }
        }
    }

    // Whole string
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // First balanced object
    if let Some(start) = trimmed.find('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, ch) in trimmed[start..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &trimmed[start..start + offset + 1];
                        return serde_json::from_str(candidate).map_err(|e| {
                            MailbriefError::Parse(format!("Malformed JSON object: {}", e))
                        });
                    }
                }
                _ => {}
            }
        }
    }

    Err(MailbriefError::Parse(
        "No JSON object found in model output".to_string(),
    ))
}

/// Validate extracted JSON against the enrichment contract
pub fn validate(value: &Value, category: Category, is_calendar_invite: bool) -> Result<ThreadInsights> {
    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            MailbriefError::Parse("Model output missing a non-empty summary".to_string())
        })?
        .to_string();

    let topic = value
        .get("topic")
        .and_then(Value::as_str)
        .map(|t| t.trim().to_lowercase())
        .filter(|t| ALLOWED_TOPICS.contains(&t.as_str()))
        .unwrap_or_else(|| "other".to_string());

    let status = value
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| ALLOWED_STATUSES.contains(&s.as_str()))
        .unwrap_or_else(|| "active".to_string());

    // Satisfaction only applies to customer-facing threads and must be
    // an integer in 1..=10; out-of-range values are dropped, not clamped
    let satisfaction_score = if category.is_customer_facing() {
        value
            .get("satisfaction_score")
            .and_then(Value::as_i64)
            .filter(|score| (1..=10).contains(score))
    } else {
        None
    };
    let satisfaction_analysis = if satisfaction_score.is_some() {
        string_field(value, "satisfaction_analysis")
    } else {
        None
    };

    // Calendar invites never escalate
    let is_escalation = !is_calendar_invite
        && value
            .get("is_escalation")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    let (escalation_reason, escalation_type) = if is_escalation {
        (
            string_field(value, "escalation_reason"),
            string_field(value, "escalation_type"),
        )
    } else {
        (None, None)
    };

    let is_billing = value
        .get("is_billing")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let billing_status = if is_billing {
        string_field(value, "billing_status")
    } else {
        None
    };

    Ok(ThreadInsights {
        summary,
        action_items: string_array(value, "action_items"),
        topic,
        labels: string_array(value, "labels"),
        satisfaction_score,
        satisfaction_analysis,
        is_escalation,
        escalation_reason,
        escalation_type,
        status,
        is_billing,
        billing_status,
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
