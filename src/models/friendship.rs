use super::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendRequestStatus {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
}

impl FriendRequest {
    /// True when this request links `a` and `b` in either direction.
    pub fn involves_pair(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

/// Friend request joined with both parties' profiles.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestView {
    #[serde(flatten)]
    pub request: FriendRequest,
    pub sender: Option<UserProfile>,
    pub receiver: Option<UserProfile>,
}

/// A friend's profile plus whether they are connected right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendView {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub is_online: bool,
}

/// Undirected friendship edge, stored with `user_a < user_b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friendship {
    pub user_a: UserId,
    pub user_b: UserId,
}

impl Friendship {
    pub fn new(x: UserId, y: UserId) -> Self {
        Self {
            user_a: x.min(y),
            user_b: x.max(y),
        }
    }

    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if self.user_a == user_id {
            Some(self.user_b)
        } else if self.user_b == user_id {
            Some(self.user_a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: String,
}

impl UserProfile {
    /// Case-insensitive substring match on name or email.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        q.is_empty()
            || self.name.to_lowercase().contains(&q)
            || self.email.to_lowercase().contains(&q)
    }
}
