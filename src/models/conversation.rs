//! Conversations and their memberships.
//!
//! A conversation is either a private two-party chat or a group. Groups carry
//! exactly one admin; private chats only ever hold plain members.

use super::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

impl ConversationKind {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

/// Member role inside a group conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member = 0,
    Admin = 1,
}

impl MemberRole {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        *self == MemberRole::Admin
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db(s).ok_or_else(|| format!("Invalid role: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub name: String,
    pub avatar: String,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMember {
    pub conversation_id: Uuid,
    pub user_id: UserId,
    pub role: MemberRole,
    /// Timestamp of the newest message this member has acknowledged
    pub last_read_msg_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

impl ConversationMember {
    pub fn new(conversation_id: Uuid, user_id: UserId, role: MemberRole, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            user_id,
            role,
            last_read_msg_time: None,
            hidden_at: None,
            joined_at: now,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

/// Member row joined with the member's public profile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub user_id: UserId,
    pub name: String,
    pub avatar: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub is_online: bool,
}

/// Conversation as listed for one viewer. Private chats take the peer's name
/// and avatar.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub name: String,
    pub avatar: String,
    pub creator_id: UserId,
    pub member_ids: Vec<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<UserId>,
    pub is_online: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_db_strings() {
        for role in [MemberRole::Admin, MemberRole::Member] {
            assert_eq!(MemberRole::from_db(role.to_db()), Some(role));
        }
        assert_eq!(MemberRole::from_db("owner"), None);
        assert!("moderator".parse::<MemberRole>().is_err());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let json = serde_json::to_string(&ConversationKind::Private).unwrap();
        assert_eq!(json, "\"private\"");
        assert_eq!(ConversationKind::from_db("group"), Some(ConversationKind::Group));
    }
}
