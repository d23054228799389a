//! Persistence ports for conversations, messages, friendships and the user
//! directory.
//!
//! Every mutating method is one atomic unit: preconditions the service has
//! already checked (membership, admin role, pending status) are checked again
//! by the store at write time, so racing requests cannot leave the tables
//! inconsistent.

use crate::error::AppResult;
use crate::models::{
    Conversation, ConversationMember, FriendRequest, Message, NewMessage, Page, UserId,
    UserProfile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Position of a message in its conversation's total order.
pub type SortKey = (DateTime<Utc>, i64);

/// Which slice of a conversation's history to read. Results are always
/// returned oldest first.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryWindow {
    /// Newest messages, skipping `offset` from the newest end.
    Latest { limit: usize, offset: usize },
    /// Messages ordered before the key; `inclusive` keeps the key itself.
    Before {
        key: SortKey,
        inclusive: bool,
        limit: usize,
    },
    /// Messages ordered after the key.
    After { key: SortKey, limit: usize },
    /// Messages with a sequence number greater than `seq`, for gap repair.
    AfterSeq { seq: i64, limit: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageFilter {
    /// Case-insensitive substring; revoked messages never match.
    pub query: Option<String>,
    pub window: HistoryWindow,
}

/// A new group with its creator as admin.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub id: Uuid,
    pub name: String,
    pub creator_id: UserId,
    pub member_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

/// Result of a membership removal: who belonged before the change, plus the
/// system message recorded with it.
#[derive(Debug, Clone)]
pub struct Removal {
    pub members_before: Vec<UserId>,
    pub system_message: Message,
}

#[derive(Debug, Clone, Default)]
pub struct GroupInfoChange {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub system_message: Option<NewMessage>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>>;

    async fn find_private_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> AppResult<Option<Conversation>>;

    /// Returns the private conversation of the unordered pair, creating it if
    /// missing. Concurrent callers converge on one conversation.
    async fn get_or_create_private(
        &self,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> AppResult<Conversation>;

    async fn create_group(
        &self,
        group: NewGroup,
        system_message: NewMessage,
    ) -> AppResult<(Conversation, Message)>;

    async fn get_member(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
    ) -> AppResult<Option<ConversationMember>>;

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<ConversationMember>>;

    /// Adds `user_id` as a plain member. Fails with `PermissionDenied` unless
    /// `actor` is still admin, `AlreadyMember` if present.
    async fn add_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        user_id: UserId,
        system_message: NewMessage,
    ) -> AppResult<Message>;

    /// Kick: `actor` must be admin, `target` a non-admin member.
    async fn remove_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        target: UserId,
        system_message: NewMessage,
    ) -> AppResult<Removal>;

    /// Voluntary leave: the admin is refused with `AdminMustTransferOrDisband`.
    async fn leave(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        system_message: NewMessage,
    ) -> AppResult<Removal>;

    /// Swaps the admin role; returns current member ids.
    async fn transfer_admin(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        new_admin: UserId,
    ) -> AppResult<Vec<UserId>>;

    /// Deletes messages, members and the conversation; returns the member ids
    /// captured before deletion.
    async fn disband(&self, actor: UserId, conversation_id: Uuid) -> AppResult<Vec<UserId>>;

    async fn update_group_info(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        change: GroupInfoChange,
    ) -> AppResult<(Conversation, Option<Message>)>;

    /// Appends a message from a current member, or returns the message already
    /// stored under the same `(conversation, client_msg_id)`. The flag is true
    /// when a new row was written. Un-hides the conversation for everyone.
    async fn append_message(&self, message: NewMessage) -> AppResult<(Message, bool)>;

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>>;

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        filter: &MessageFilter,
    ) -> AppResult<Vec<Message>>;

    /// Marks the message revoked and clears its content, only if it belongs to
    /// `sender`, is not yet revoked and was created at or after `not_before`.
    /// Returns `None` when any of those no longer holds.
    async fn revoke_message(
        &self,
        id: Uuid,
        sender: UserId,
        not_before: DateTime<Utc>,
    ) -> AppResult<Option<Message>>;

    /// Moves the member's read pointer forward to `at`. Returns false when the
    /// pointer was already at or past it.
    async fn advance_read_pointer(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Substring search over the user's conversations, newest first.
    async fn search_messages(
        &self,
        user_id: UserId,
        query: &str,
        page: Page,
    ) -> AppResult<(Vec<Message>, usize)>;

    /// Conversations the user belongs to and has not hidden, most recently
    /// active first.
    async fn list_visible_conversations(&self, user_id: UserId) -> AppResult<Vec<Conversation>>;

    async fn hide_conversation(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Everyone sharing a group conversation with the user, excluding the
    /// user, ascending and without duplicates.
    async fn group_peer_ids(&self, user_id: UserId) -> AppResult<Vec<UserId>>;
}

#[async_trait]
pub trait FriendStore: Send + Sync {
    /// Fails with `AlreadyFriends` or `DuplicatePending` when checked at write
    /// time.
    async fn create_request(
        &self,
        sender: UserId,
        receiver: UserId,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<FriendRequest>;

    async fn get_request(&self, id: Uuid) -> AppResult<Option<FriendRequest>>;

    /// Transitions a pending request. Accepting also records the friendship.
    async fn resolve_request(
        &self,
        id: Uuid,
        responder: UserId,
        accept: bool,
    ) -> AppResult<FriendRequest>;

    async fn are_friends(&self, a: UserId, b: UserId) -> AppResult<bool>;

    async fn pending_between(&self, a: UserId, b: UserId) -> AppResult<Option<FriendRequest>>;

    async fn list_friend_ids(&self, user_id: UserId) -> AppResult<Vec<UserId>>;

    /// Requests sent or received by the user, newest first.
    async fn list_requests(&self, user_id: UserId) -> AppResult<Vec<FriendRequest>>;

    /// Returns false when no edge existed.
    async fn delete_friendship(&self, a: UserId, b: UserId) -> AppResult<bool>;
}

/// Read-only view of the platform's user table.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: UserId) -> AppResult<Option<UserProfile>>;

    async fn get_users(&self, ids: &[UserId]) -> AppResult<Vec<UserProfile>>;

    async fn find_by_email(&self, email: &str) -> AppResult<Option<UserProfile>>;

    async fn search_users(&self, query: &str, limit: usize) -> AppResult<Vec<UserProfile>>;
}

/// Orders a pair so the private-chat key does not depend on argument order.
pub fn pair_key(a: UserId, b: UserId) -> (UserId, UserId) {
    (a.min(b), a.max(b))
}

pub(crate) fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
