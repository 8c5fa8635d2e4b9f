//! Thread classification and filtering
//!
//! Pure rules, no IO. Decides which provider messages are worth keeping,
//! detects calendar invites, assigns each thread a category, and derives
//! the thread-level rollups (participants, unread, attachments) from the
//! surviving messages.

use chrono::{DateTime, TimeZone, Utc};

use crate::config::OrgConfig;
use crate::provider::types::{GmailMessage, GmailThread};
use crate::sync::db::{MessageUpsert, Participant, ThreadUpsert};

/// Labels that always exclude a message from sync
const DEFAULT_SKIP_LABELS: &[&str] = &[
    "SPAM",
    "TRASH",
    "CATEGORY_PROMOTIONS",
    "CATEGORY_SOCIAL",
    "CATEGORY_UPDATES",
];

/// Subject prefixes provider calendars put on invite mail
const CALENDAR_SUBJECT_PREFIXES: &[&str] = &[
    "invitation:",
    "accepted:",
    "declined:",
    "tentatively accepted:",
    "updated invitation:",
    "canceled event:",
    "cancelled event:",
];

/// Sender addresses that only ever carry calendar notifications
const CALENDAR_SENDER_PATTERNS: &[&str] = &[
    "calendar-notification@google.com",
    "calendar-server@",
    "noreply@calendar",
];

/// Snippet phrases that, in pairs, indicate an invite body
const CALENDAR_SNIPPET_PHRASES: &[&str] = &["view event", "going?", "when:", "where:", "rsvp"];

const SUPPORT_SUBJECT_KEYWORDS: &[&str] = &[
    "help", "issue", "problem", "error", "bug", "broken", "urgent", "not working",
];

const ONBOARDING_SUBJECT_KEYWORDS: &[&str] =
    &["welcome", "getting started", "onboarding", "setup", "activation"];

/// Thread category, in precedence order of the signals that assign it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Support,
    Onboarding,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Onboarding => "onboarding",
            Self::General => "general",
        }
    }

    /// Customer-facing categories get satisfaction scoring during
    /// enrichment
    pub fn is_customer_facing(&self) -> bool {
        matches!(self, Self::Support | Self::Onboarding)
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "support" => Self::Support,
            "onboarding" => Self::Onboarding,
            _ => Self::General,
        }
    }
}

/// A thread reduced to its persistable form
#[derive(Debug, Clone)]
pub struct ClassifiedThread {
    pub thread: ThreadUpsert,
    pub messages: Vec<MessageUpsert>,
    pub category: Category,
}

pub struct ThreadClassifier {
    domain: String,
    support_address: String,
    onboarding_address: String,
    extra_skip_labels: Vec<String>,
}

impl ThreadClassifier {
    pub fn new(org: &OrgConfig) -> Self {
        Self {
            domain: org.domain.to_lowercase(),
            support_address: org.support_address.to_lowercase(),
            onboarding_address: org.onboarding_address.to_lowercase(),
            extra_skip_labels: org.skip_labels.iter().map(|l| l.to_uppercase()).collect(),
        }
    }

    /// Classify a fetched thread for a user. Returns None when the
    /// thread is filtered out: any message carrying a skip label excludes
    /// the whole thread.
    pub fn classify(&self, user_email: &str, thread: &GmailThread) -> Option<ClassifiedThread> {
        if thread.messages.is_empty()
            || thread.messages.iter().any(|m| self.should_skip(&m.label_ids))
        {
            return None;
        }
        let kept: Vec<&GmailMessage> = thread.messages.iter().collect();

        let category = self.categorize(&kept);
        let is_calendar_invite = kept.iter().any(|m| is_calendar_invite(m));

        let user_lower = user_email.to_lowercase();
        let mut participants: Vec<Participant> = Vec::new();
        let mut directly_addressed = false;
        let mut labels: Vec<String> = Vec::new();
        let mut first_message_at: Option<DateTime<Utc>> = None;
        let mut last_message_at: Option<DateTime<Utc>> = None;

        let mut messages: Vec<MessageUpsert> = Vec::with_capacity(kept.len());
        for message in &kept {
            let from = parse_address_list(message.header("From").unwrap_or_default());
            let to = parse_address_list(message.header("To").unwrap_or_default());
            let cc = parse_address_list(message.header("Cc").unwrap_or_default());

            if to.iter().chain(cc.iter()).any(|a| a.email == user_lower) {
                directly_addressed = true;
            }
            for address in from.iter().chain(to.iter()).chain(cc.iter()) {
                if !participants.iter().any(|p| p.email == address.email) {
                    participants.push(Participant {
                        email: address.email.clone(),
                        name: address.name.clone(),
                        internal: address.email.ends_with(&format!("@{}", self.domain)),
                    });
                }
            }
            for label in &message.label_ids {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }

            let timestamp = message
                .timestamp_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
            if let Some(ts) = timestamp {
                first_message_at = Some(first_message_at.map_or(ts, |f| f.min(ts)));
                last_message_at = Some(last_message_at.map_or(ts, |l| l.max(ts)));
            }

            messages.push(MessageUpsert {
                user_email: user_email.to_string(),
                provider_message_id: message.id.clone(),
                provider_thread_id: thread.id.clone(),
                subject: message.header("Subject").map(|s| s.to_string()),
                from_address: from.first().map(|a| a.email.clone()).unwrap_or_default(),
                to_addresses: to.iter().map(|a| a.email.clone()).collect(),
                cc_addresses: cc.iter().map(|a| a.email.clone()).collect(),
                timestamp,
                snippet: message.snippet.clone(),
                labels: message.label_ids.clone(),
                category: category.as_str().to_string(),
                unread: message.label_ids.iter().any(|l| l == "UNREAD"),
                has_attachment: message.has_attachment(),
            });
        }

        let subject = kept
            .iter()
            .find_map(|m| m.header("Subject"))
            .map(|s| s.to_string());

        let thread_upsert = ThreadUpsert {
            user_email: user_email.to_string(),
            provider_thread_id: thread.id.clone(),
            subject,
            participants,
            directly_addressed,
            category: category.as_str().to_string(),
            labels,
            unread: messages.iter().any(|m| m.unread),
            has_attachments: messages.iter().any(|m| m.has_attachment),
            message_count: messages.len() as u32,
            first_message_at,
            last_message_at,
            is_calendar_invite,
        };

        Some(ClassifiedThread {
            thread: thread_upsert,
            messages,
            category,
        })
    }

    fn should_skip(&self, labels: &[String]) -> bool {
        labels.iter().any(|label| {
            DEFAULT_SKIP_LABELS.contains(&label.as_str())
                || self.extra_skip_labels.iter().any(|extra| extra == label)
        })
    }

    /// Category precedence: routing address, then label text, then
    /// subject keywords, then general
    fn categorize(&self, messages: &[&GmailMessage]) -> Category {
        for message in messages {
            let recipients = format!(
                "{} {}",
                message.header("To").unwrap_or_default(),
                message.header("Cc").unwrap_or_default()
            )
            .to_lowercase();
            if recipients.contains(&self.support_address) {
                return Category::Support;
            }
            if recipients.contains(&self.onboarding_address) {
                return Category::Onboarding;
            }
        }

        for message in messages {
            for label in &message.label_ids {
                let lower = label.to_lowercase();
                if lower.contains("support") {
                    return Category::Support;
                }
                if lower.contains("onboarding") {
                    return Category::Onboarding;
                }
            }
        }

        for message in messages {
            let subject = message.header("Subject").unwrap_or_default().to_lowercase();
            if SUPPORT_SUBJECT_KEYWORDS.iter().any(|k| subject.contains(k)) {
                return Category::Support;
            }
            if ONBOARDING_SUBJECT_KEYWORDS.iter().any(|k| subject.contains(k)) {
                return Category::Onboarding;
            }
        }

        Category::General
    }
}

/// Detect calendar invite mail from subject, sender, MIME parts, or a
/// combination of snippet phrases
pub fn is_calendar_invite(message: &GmailMessage) -> bool {
    let subject = message.header("Subject").unwrap_or_default().to_lowercase();
    if CALENDAR_SUBJECT_PREFIXES
        .iter()
        .any(|prefix| subject.starts_with(prefix))
    {
        return true;
    }

    let from = message.header("From").unwrap_or_default().to_lowercase();
    if CALENDAR_SENDER_PATTERNS
        .iter()
        .any(|pattern| from.contains(pattern))
    {
        return true;
    }

    if message.has_calendar_part() {
        return true;
    }

    // Single phrases appear in ordinary mail; require two
    let snippet = message.snippet.as_deref().unwrap_or_default().to_lowercase();
    let hits = CALENDAR_SNIPPET_PHRASES
        .iter()
        .filter(|phrase| snippet.contains(*phrase))
        .count();
    hits >= 2
}

#[derive(Debug, Clone)]
struct Address {
    email: String,
    name: Option<String>,
}

/// Parse a comma-separated header like `"Jane Doe" <jane@acme.dev>, bob@x.dev`
fn parse_address_list(raw: &str) -> Vec<Address> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            if let (Some(open), Some(close)) = (part.rfind('<'), part.rfind('>')) {
                if open < close {
                    let email = part[open + 1..close].trim().to_lowercase();
                    if email.is_empty() {
                        return None;
                    }
                    let name = part[..open].trim().trim_matches('"').trim();
                    return Some(Address {
                        email,
                        name: if name.is_empty() {
                            None
                        } else {
                            Some(name.to_string())
                        },
                    });
                }
            }
            Some(Address {
                email: part.to_lowercase(),
                name: None,
            })
        })
        .filter(|address| address.email.contains('@'))
        .collect()
}
