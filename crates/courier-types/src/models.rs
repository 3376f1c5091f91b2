use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emoji accepted for reactions. Both palettes shipped by clients over time
/// are accepted.
pub const REACTION_EMOJIS: &[&str] = &["👍", "❤️", "🧡", "😂", "😮", "🙂", "😢", "🙏"];

pub fn is_reaction_emoji(emoji: &str) -> bool {
    REACTION_EMOJIS.iter().any(|e| *e == emoji)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub username: String,
}

impl ChatUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
}

/// A reaction as attached to a message inside `history` and `chat` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReaction {
    #[serde(rename = "type")]
    pub emoji: String,
    pub from: ChatUser,
}

/// A message as rendered by clients. Carries everything needed to draw it,
/// so a process receiving it from the broker never queries the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub from: ChatUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChatUser>,
    pub date: DateTime<Utc>,
    pub message: String,
    pub status: MessageStatus,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub reactions: Vec<ChatReaction>,
}

impl ChatMessage {
    /// A message visible to everyone has no recipient.
    pub fn is_direct(&self) -> bool {
        self.recipient.is_some()
    }

    pub fn recipient_username(&self) -> Option<&str> {
        self.recipient.as_ref().map(|r| r.username.as_str())
    }
}

/// One entry of a `reaction` envelope's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEntry {
    pub emoji: String,
    pub user: String,
}
