//! Wire types for the mail provider REST API

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailProfile {
    pub email_address: String,
    /// Current head of the mailbox change log
    pub history_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessageList {
    #[serde(default)]
    pub messages: Vec<MessageStub>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStub {
    pub id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailHistoryList {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub history_id: Option<String>,
    pub next_page_token: Option<String>,
}

/// One entry in the mailbox change log. Only the message stubs matter;
/// every change kind resolves to "re-fetch the affected thread".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(default)]
    pub messages_added: Vec<HistoryMessageChange>,
    #[serde(default)]
    pub messages_deleted: Vec<HistoryMessageChange>,
    #[serde(default)]
    pub labels_added: Vec<HistoryMessageChange>,
    #[serde(default)]
    pub labels_removed: Vec<HistoryMessageChange>,
}

impl HistoryRecord {
    /// All message stubs this record touches
    pub fn touched_messages(&self) -> impl Iterator<Item = &MessageStub> {
        self.messages_added
            .iter()
            .chain(self.messages_deleted.iter())
            .chain(self.labels_added.iter())
            .chain(self.labels_removed.iter())
            .map(|change| &change.message)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessageChange {
    pub message: MessageStub,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailThread {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<GmailMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    /// Milliseconds since the epoch, as a string
    pub internal_date: Option<String>,
    pub payload: Option<MessagePayload>,
}

impl GmailMessage {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        })
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.internal_date.as_deref().and_then(|s| s.parse().ok())
    }

    /// True if any part carries a real (named) attachment
    pub fn has_attachment(&self) -> bool {
        fn walk(payload: &MessagePayload) -> bool {
            if payload.filename.as_deref().is_some_and(|f| !f.is_empty()) {
                return true;
            }
            payload.parts.iter().any(walk)
        }
        self.payload.as_ref().is_some_and(walk)
    }

    /// True if any MIME part is text/calendar
    pub fn has_calendar_part(&self) -> bool {
        fn walk(payload: &MessagePayload) -> bool {
            if payload
                .mime_type
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case("text/calendar"))
            {
                return true;
            }
            payload.parts.iter().any(walk)
        }
        self.payload.as_ref().is_some_and(walk)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub parts: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}
