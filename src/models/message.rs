use super::{ConversationKind, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    VoiceCall,
    File,
    System,
}

impl MessageKind {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "voice_call" => Some(Self::VoiceCall),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::VoiceCall => "voice_call",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

/// Message row. Ordering within a conversation is `(created_at, seq)`;
/// `seq` is assigned by the store and strictly increases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// `None` for system messages
    pub sender_id: Option<UserId>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub client_msg_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
    pub is_revoked: bool,
}

impl Message {
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.seq)
    }

    pub fn is_system(&self) -> bool {
        self.sender_id.is_none()
    }
}

/// Fields supplied when appending a message; the store assigns `id` and
/// `seq`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Option<UserId>,
    pub kind: MessageKind,
    pub content: String,
    pub client_msg_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn system(conversation_id: Uuid, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            sender_id: None,
            kind: MessageKind::System,
            content: content.into(),
            client_msg_id: None,
            created_at: now,
        }
    }
}

/// Message as rendered for one viewer, with derived read receipt fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub is_read: bool,
    pub read_count: usize,
    pub can_revoke: bool,
    /// Presence of the sender; false for system messages
    pub is_online: bool,
}

/// Global search hit with enough conversation context to render it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub message: Message,
    pub conversation_type: ConversationKind,
    pub conversation_name: String,
    pub conversation_avatar: String,
}
