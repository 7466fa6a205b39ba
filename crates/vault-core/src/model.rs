//! Note data carried by the vault: context records, bookmarks, activity logs.
//!
//! Field names serialize in camelCase so local and remote JSON stay readable by
//! every device that shares the same document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Prefix shared by every key that takes part in a snapshot.
pub const SNAPSHOT_KEY_PREFIX: &str = "ctx_";

/// Prefix of bookmark list keys (a sub-namespace of [`SNAPSHOT_KEY_PREFIX`]).
pub const BOOKMARKS_KEY_PREFIX: &str = "ctx_bookmarks_";

/// Storage key of the context record for a conversation.
pub fn context_key(domain: &str, chat_id: &str) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}{domain}_{chat_id}")
}

/// Storage key of the bookmark list for a conversation.
pub fn bookmarks_key(domain: &str, chat_id: &str) -> String {
    format!("{BOOKMARKS_KEY_PREFIX}{domain}_{chat_id}")
}

/// Whether a local key belongs in the snapshot exchanged with the remote.
///
/// Scalar settings never use the `ctx_` prefix.
pub fn is_snapshot_key(key: &str) -> bool {
    key.starts_with(SNAPSHOT_KEY_PREFIX)
}

/// Split a page URL into `(domain, chat_id)`.
///
/// The chat id is the last non-empty path segment, or `"default"` when the
/// path has none. Unparseable URLs map to `("unknown", "default")`.
pub fn parse_url_for_ids(url: &str) -> (String, String) {
    let Ok(parsed) = Url::parse(url) else {
        return ("unknown".into(), "default".into());
    };

    let domain = parsed.host_str().unwrap_or("unknown").to_string();
    let chat_id = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("default")
        .to_string();

    (domain, chat_id)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A single note attached to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Stable identity across replicas. Empty for legacy entries, which are
    /// matched by `text` instead.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

fn default_active() -> bool {
    true
}

impl Entry {
    /// Create a fresh, active entry with a generated id.
    pub fn new(text: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: format!("entry_{}", uuid::Uuid::new_v4()),
            text: text.into(),
            active: true,
            created: now,
            last_modified: Some(now),
        }
    }

    /// Two entries describe the same note if their ids match. Text is only
    /// compared when one side is a legacy entry without an id.
    pub fn same_note(&self, other: &Entry) -> bool {
        if self.id.is_empty() || other.id.is_empty() {
            self.text == other.text
        } else {
            self.id == other.id
        }
    }
}

/// Notes and summary for one `(domain, chat_id)` conversation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub summary: String,
    /// Missing `entries` arrays are normalized to empty on decode.
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl ContextRecord {
    pub fn empty(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            ..Default::default()
        }
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// A saved position inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub chat_id: String,
    /// DOM selector of the bookmarked message.
    #[serde(default)]
    pub selector: String,
    /// Message text used to relocate the bookmark when the selector breaks.
    #[serde(default)]
    pub fallback_text: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl Bookmark {
    pub fn new(
        domain: impl Into<String>,
        chat_id: impl Into<String>,
        label: impl Into<String>,
        selector: impl Into<String>,
        fallback_text: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: format!("bm_{}", uuid::Uuid::new_v4()),
            label: label.into(),
            domain: domain.into(),
            chat_id: chat_id.into(),
            selector: selector.into(),
            fallback_text: fallback_text.into(),
            created: now,
            last_modified: Some(now),
        }
    }
}

/// Metadata captured alongside a logged message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMetadata {
    #[serde(default)]
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    /// Platform-specific extras (role, model name, ...) carried verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Binary payload attached to a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Attachment {
    /// Freshly captured payload, base64 encoded. Never pushed as-is.
    Inline { mime: String, data: String },
    /// Reference to a blob stored under its content fingerprint.
    Stored { mime: String, blob: String },
}

/// One captured chat message in the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    /// `"input"` or `"output"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub metadata: LogMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Identity used to deduplicate log entries across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogIdentity {
    Message { message_id: String, timestamp: i64 },
    Content {
        chat_id: String,
        kind: String,
        text: String,
        timestamp: i64,
    },
}

impl LogEntry {
    pub fn new(chat_id: impl Into<String>, kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            kind: kind.into(),
            metadata: LogMetadata {
                chat_id: chat_id.into(),
                ..Default::default()
            },
            attachments: Vec::new(),
        }
    }

    pub fn identity(&self) -> LogIdentity {
        match &self.metadata.message_id {
            Some(message_id) => LogIdentity::Message {
                message_id: message_id.clone(),
                timestamp: self.metadata.timestamp,
            },
            None => LogIdentity::Content {
                chat_id: self.metadata.chat_id.clone(),
                kind: self.kind.clone(),
                text: self.text.clone(),
                timestamp: self.metadata.timestamp,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(context_key("chat.openai.com", "abc"), "ctx_chat.openai.com_abc");
        assert_eq!(
            bookmarks_key("claude.ai", "xyz"),
            "ctx_bookmarks_claude.ai_xyz"
        );
        assert!(is_snapshot_key(&bookmarks_key("a", "b")));
        assert!(!is_snapshot_key("lastKnownSha"));
    }

    #[test]
    fn test_parse_url_for_ids() {
        assert_eq!(
            parse_url_for_ids("https://chat.openai.com/c/abc123"),
            ("chat.openai.com".into(), "abc123".into())
        );
        assert_eq!(
            parse_url_for_ids("https://claude.ai/chat/xyz/"),
            ("claude.ai".into(), "xyz".into())
        );
        assert_eq!(
            parse_url_for_ids("https://claude.ai/"),
            ("claude.ai".into(), "default".into())
        );
        assert_eq!(
            parse_url_for_ids("not a url"),
            ("unknown".into(), "default".into())
        );
    }

    #[test]
    fn test_context_record_missing_entries_normalized() {
        let record: ContextRecord =
            serde_json::from_str(r#"{"chatId":"abc","summary":"s"}"#).unwrap();
        assert!(record.entries.is_empty());
    }

    #[test]
    fn test_legacy_entry_without_id() {
        let entry: Entry = serde_json::from_str(r#"{"text":"hello","created":5}"#).unwrap();
        assert!(entry.id.is_empty());
        assert!(entry.active);

        let other = Entry {
            id: "entry_9".into(),
            ..entry.clone()
        };
        assert!(entry.same_note(&other), "legacy entries match on text");

        let distinct = Entry {
            id: "entry_10".into(),
            ..entry.clone()
        };
        assert!(!other.same_note(&distinct), "ids decide once both sides have one");
    }

    #[test]
    fn test_log_identity() {
        let mut a = LogEntry::new("c1", "input", "hi");
        a.metadata.message_id = Some("m1".into());
        a.metadata.timestamp = 10;

        let mut b = LogEntry::new("c1", "input", "edited text");
        b.metadata.message_id = Some("m1".into());
        b.metadata.timestamp = 10;

        assert_eq!(a.identity(), b.identity());

        let c = LogEntry::new("c1", "input", "hi");
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn test_log_entry_json_shape() {
        let mut entry = LogEntry::new("c1", "output", "answer");
        entry.metadata.extra.insert("role".into(), Value::from("assistant"));
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["type"], "output");
        assert_eq!(json["metadata"]["chatId"], "c1");
        assert_eq!(json["metadata"]["role"], "assistant");
        assert!(json.get("attachments").is_none());
    }
}
