//! Mailbox data types.

use serde::{Deserialize, Serialize};

use super::fs::{now_ms, now_timestamp, parse_timestamp_ms};

/// On-disk mailbox document (`inbox.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxDocument {
    #[serde(default)]
    pub messages: Vec<MailboxMessage>,
}

/// A single mailbox message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: String,
    pub from: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data_url: Option<String>,
}

impl MailboxMessage {
    /// Create a message stamped with a fresh id and the current time.
    pub fn new(from: &str, message: &str, thread_id: &str) -> Self {
        Self {
            id: generate_message_id(),
            from: from.to_string(),
            message: message.to_string(),
            timestamp: now_timestamp(),
            thread_id: Some(thread_id.to_string()),
            reply_to: None,
            read_by: Vec::new(),
            image_path: None,
            image_data_url: None,
        }
    }

    /// Whether `reader` has already read this message.
    pub fn is_read_by(&self, reader: &str) -> bool {
        self.read_by.iter().any(|r| r == reader)
    }

    /// Record `reader` in `read_by`. Returns `true` if it was added.
    pub fn mark_read_by(&mut self, reader: &str) -> bool {
        if self.is_read_by(reader) {
            return false;
        }
        self.read_by.push(reader.to_string());
        true
    }

    /// Timestamp in epoch ms; unparseable timestamps count as the epoch.
    pub fn timestamp_ms(&self) -> u64 {
        parse_timestamp_ms(&self.timestamp).unwrap_or(0)
    }

    /// Whether this message was sent by `sender`, ignoring case.
    pub fn is_from(&self, sender: &str) -> bool {
        self.from.eq_ignore_ascii_case(sender)
    }

    pub fn has_image(&self) -> bool {
        self.image_path.is_some() || self.image_data_url.is_some()
    }
}

/// Trigger record written beside the mailbox after every send so a UI
/// watching a single small file learns about new messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTrigger {
    pub from: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub timestamp: String,
    pub thread_id: Option<String>,
}

/// In-process notification raised by the mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxEvent {
    /// A message was appended to the mailbox.
    MessageSent {
        id: String,
        from: String,
        thread_id: String,
    },
}

/// Generate a unique message id: `msg-<epoch ms>-<6 hex chars>`.
pub fn generate_message_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("msg-{}-{}", now_ms(), &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_unique() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert!(a.starts_with("msg-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_mark_read_is_monotonic() {
        let mut msg = MailboxMessage::new("nathan", "Hello", "voice-mirror");
        assert!(!msg.is_read_by("voice-claude"));
        assert!(msg.mark_read_by("voice-claude"));
        assert!(!msg.mark_read_by("voice-claude"));
        assert_eq!(msg.read_by, vec!["voice-claude"]);
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let raw = r#"{"id":"msg-1","from":"nathan","message":"hi","timestamp":"2026-01-01T00:00:00"}"#;
        let msg: MailboxMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.read_by.is_empty());
        assert!(msg.thread_id.is_none());
        assert!(msg.timestamp_ms() > 0);
        assert!(msg.is_from("NATHAN"));
    }

    #[test]
    fn test_serialize_skips_absent_images() {
        let msg = MailboxMessage::new("nathan", "hi", "t");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("image_path"));
        assert!(json.contains("\"read_by\":[]"));
    }
}
