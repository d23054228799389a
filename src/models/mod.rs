pub mod conversation;
pub mod friendship;
pub mod message;

pub use conversation::{
    Conversation, ConversationKind, ConversationMember, ConversationView, MemberRole, MemberView,
};
pub use friendship::{
    FriendRequest, FriendRequestStatus, FriendRequestView, FriendView, Friendship, UserProfile,
};
pub use message::{Message, MessageKind, MessageView, NewMessage, SearchHit};

/// Platform user id, as issued by the gateway.
pub type UserId = i64;

/// Offset/limit window shared by listing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 100;

    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(20, 0)
    }
}

/// A page of results plus the unpaginated total.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: usize,
}
