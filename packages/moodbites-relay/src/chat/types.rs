//! Conversation and message types.
//!
//! These are both the storage records and the JSON shapes sent to clients,
//! so field names follow the wire convention (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Longest accepted user identifier.
pub const MAX_USER_ID_LEN: usize = 128;

/// Longest conversation summary kept on the header.
pub const MAX_SUMMARY_CHARS: usize = 120;

/// Check that a user identifier is usable as a storage key and channel name.
pub fn validate_user_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_USER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '@'));
    if ok {
        Ok(())
    } else {
        Err(RelayError::InvalidUserId(id.to_string()))
    }
}

/// Content kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
    /// A shared diet plan.
    Plan,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Audio => "audio",
            MessageKind::Plan => "plan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "audio" => Some(MessageKind::Audio),
            "plan" => Some(MessageKind::Plan),
            _ => None,
        }
    }
}

/// Kind-specific message fields.
///
/// Flattened into both the inbound `send-message` payload and the stored
/// message, so a file message reads `{ "messageType": "file", "fileUrl": ... }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_calories: Option<u32>,
}

impl Attachment {
    pub fn is_empty(&self) -> bool {
        *self == Attachment::default()
    }

    /// Keep only the fields that belong to `kind`, checking the required ones.
    pub fn for_kind(self, kind: MessageKind) -> Result<Attachment> {
        fn required(field: Option<String>, name: &str, kind: MessageKind) -> Result<String> {
            match field {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(RelayError::InvalidPayload(format!(
                    "{} is required for {} messages",
                    name,
                    kind.as_str()
                ))),
            }
        }

        match kind {
            MessageKind::Text => Ok(Attachment::default()),
            MessageKind::Image | MessageKind::File => Ok(Attachment {
                file_url: Some(required(self.file_url, "fileUrl", kind)?),
                file_name: self.file_name,
                file_size: self.file_size,
                file_type: self.file_type,
                ..Attachment::default()
            }),
            MessageKind::Audio => {
                if matches!(self.audio_duration, Some(d) if !d.is_finite() || d < 0.0) {
                    return Err(RelayError::InvalidPayload(
                        "audioDuration must be a non-negative number".to_string(),
                    ));
                }
                Ok(Attachment {
                    audio_url: Some(required(self.audio_url, "audioUrl", kind)?),
                    audio_duration: self.audio_duration,
                    ..Attachment::default()
                })
            }
            MessageKind::Plan => Ok(Attachment {
                plan_id: Some(required(self.plan_id, "planId", kind)?),
                plan_name: self.plan_name,
                total_calories: self.total_calories,
                ..Attachment::default()
            }),
        }
    }
}

/// A validated message ready to be appended to a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub attachment: Attachment,
}

impl NewMessage {
    /// Text shown as the conversation's last message.
    pub fn summary(&self) -> String {
        let body = self.body.trim();
        let summary = if !body.is_empty() {
            body.to_string()
        } else {
            match self.kind {
                MessageKind::Text => String::new(),
                MessageKind::Image => "[image]".to_string(),
                MessageKind::File => self
                    .attachment
                    .file_name
                    .clone()
                    .unwrap_or_else(|| "[file]".to_string()),
                MessageKind::Audio => "[audio]".to_string(),
                MessageKind::Plan => self
                    .attachment
                    .plan_name
                    .clone()
                    .unwrap_or_else(|| "[diet plan]".to_string()),
            }
        };
        summary.chars().take(MAX_SUMMARY_CHARS).collect()
    }
}

/// A message embedded in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "messageType")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(flatten)]
    pub attachment: Attachment,
}

/// A durable two-party conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Always two ids, in normalized (sorted) order.
    pub participants: Vec<String>,
    pub last_message: String,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Chronological, oldest first.
    pub messages: Vec<ChatMessage>,
}

/// Aggregate counts for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub total_messages: u64,
    pub unread_messages: u64,
}

/// Result of appending a message.
#[derive(Debug, Clone)]
pub struct AppendedMessage {
    pub conversation_id: String,
    pub message: ChatMessage,
    /// True when this append created the conversation.
    pub created_conversation: bool,
}

/// Result of a read-receipt request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// The flag flipped from unread to read.
    Marked { sender_id: String },
    /// The message was already read; nothing changed.
    AlreadyRead,
    /// The requester is not the message's receiver; nothing changed.
    NotRecipient,
}

/// Order a participant pair so that `{a, b}` and `{b, a}` share one key.
pub fn participant_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
