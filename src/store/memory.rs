//! In-process store used by tests and by store-less development runs.
//!
//! All state sits behind one async mutex, so each trait method observes and
//! mutates a consistent snapshot, which is what gives the conditional writes
//! their atomicity.

use super::{
    contains_ci, pair_key, ChatStore, FriendStore, GroupInfoChange, HistoryWindow, MessageFilter,
    NewGroup, Removal, UserDirectory,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationKind, ConversationMember, FriendRequest, FriendRequestStatus,
    Friendship, MemberRole, Message, NewMessage, Page, UserId, UserProfile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: BTreeMap<UserId, UserProfile>,
    conversations: HashMap<Uuid, Conversation>,
    private_index: HashMap<(UserId, UserId), Uuid>,
    members: HashMap<Uuid, BTreeMap<UserId, ConversationMember>>,
    messages: HashMap<Uuid, Message>,
    // message ids per conversation, kept in (created_at, seq) order
    timeline: HashMap<Uuid, Vec<Uuid>>,
    client_ids: HashMap<(Uuid, String), Uuid>,
    next_seq: i64,
    requests: HashMap<Uuid, FriendRequest>,
    friendships: HashSet<Friendship>,
}

impl Inner {
    fn conversation(&self, id: Uuid) -> AppResult<&Conversation> {
        self.conversations
            .get(&id)
            .ok_or(AppError::NotFound("conversation"))
    }

    fn member(&self, conversation_id: Uuid, user_id: UserId) -> Option<&ConversationMember> {
        self.members
            .get(&conversation_id)
            .and_then(|m| m.get(&user_id))
    }

    fn member_ids(&self, conversation_id: Uuid) -> Vec<UserId> {
        self.members
            .get(&conversation_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    fn require_admin(&self, conversation_id: Uuid, actor: UserId) -> AppResult<()> {
        self.conversation(conversation_id)?;
        match self.member(conversation_id, actor) {
            None => Err(AppError::NotMember),
            Some(m) if !m.is_admin() => Err(AppError::PermissionDenied),
            Some(_) => Ok(()),
        }
    }

    fn add_member_row(
        &mut self,
        conversation_id: Uuid,
        user_id: UserId,
        role: MemberRole,
        now: DateTime<Utc>,
    ) {
        self.members
            .entry(conversation_id)
            .or_default()
            .insert(user_id, ConversationMember::new(conversation_id, user_id, role, now));
    }

    fn insert_message(&mut self, new: NewMessage) -> Message {
        self.next_seq += 1;
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            kind: new.kind,
            content: new.content,
            client_msg_id: new.client_msg_id,
            created_at: new.created_at,
            seq: self.next_seq,
            is_revoked: false,
        };

        if let Some(client_id) = &message.client_msg_id {
            self.client_ids
                .insert((message.conversation_id, client_id.clone()), message.id);
        }

        let key = message.sort_key();
        let messages = &self.messages;
        let timeline = self.timeline.entry(message.conversation_id).or_default();
        let pos = timeline.partition_point(|id| {
            messages
                .get(id)
                .map(|m| m.sort_key() <= key)
                .unwrap_or(true)
        });
        timeline.insert(pos, message.id);

        if let Some(conv) = self.conversations.get_mut(&message.conversation_id) {
            if message.created_at > conv.updated_at {
                conv.updated_at = message.created_at;
            }
        }
        if let Some(members) = self.members.get_mut(&message.conversation_id) {
            for member in members.values_mut() {
                member.hidden_at = None;
            }
        }

        self.messages.insert(message.id, message.clone());
        message
    }

    fn ordered_messages(&self, conversation_id: Uuid) -> Vec<&Message> {
        self.timeline
            .get(&conversation_id)
            .map(|ids| ids.iter().filter_map(|id| self.messages.get(id)).collect())
            .unwrap_or_default()
    }

    fn remove_conversation(&mut self, conversation_id: Uuid) {
        if let Some(ids) = self.timeline.remove(&conversation_id) {
            for id in ids {
                self.messages.remove(&id);
            }
        }
        self.client_ids.retain(|(conv, _), _| *conv != conversation_id);
        self.members.remove(&conversation_id);
        if let Some(conv) = self.conversations.remove(&conversation_id) {
            if conv.kind == ConversationKind::Private {
                self.private_index.retain(|_, id| *id != conversation_id);
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = UserProfile>) -> Self {
        let mut inner = Inner::default();
        for user in users {
            inner.users.insert(user.id, user);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub async fn insert_user(&self, user: UserProfile) {
        self.inner.lock().await.users.insert(user.id, user);
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.inner.lock().await.conversations.get(&id).cloned())
    }

    async fn find_private_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> AppResult<Option<Conversation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .private_index
            .get(&pair_key(a, b))
            .and_then(|id| inner.conversations.get(id))
            .cloned())
    }

    async fn get_or_create_private(
        &self,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> AppResult<Conversation> {
        let mut inner = self.inner.lock().await;
        let key = pair_key(a, b);
        if let Some(conv) = inner
            .private_index
            .get(&key)
            .and_then(|id| inner.conversations.get(id))
        {
            return Ok(conv.clone());
        }

        let conv = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Private,
            name: String::new(),
            avatar: String::new(),
            creator_id: a,
            created_at: now,
            updated_at: now,
        };
        inner.conversations.insert(conv.id, conv.clone());
        inner.private_index.insert(key, conv.id);
        inner.add_member_row(conv.id, a, MemberRole::Member, now);
        inner.add_member_row(conv.id, b, MemberRole::Member, now);
        Ok(conv)
    }

    async fn create_group(
        &self,
        group: NewGroup,
        system_message: NewMessage,
    ) -> AppResult<(Conversation, Message)> {
        let mut inner = self.inner.lock().await;
        let conv = Conversation {
            id: group.id,
            kind: ConversationKind::Group,
            name: group.name,
            avatar: String::new(),
            creator_id: group.creator_id,
            created_at: group.created_at,
            updated_at: group.created_at,
        };
        inner.conversations.insert(conv.id, conv.clone());
        inner.add_member_row(conv.id, group.creator_id, MemberRole::Admin, group.created_at);
        for user_id in group.member_ids {
            if inner.member(conv.id, user_id).is_none() {
                inner.add_member_row(conv.id, user_id, MemberRole::Member, group.created_at);
            }
        }
        let message = inner.insert_message(system_message);
        let conv = inner.conversation(conv.id)?.clone();
        Ok((conv, message))
    }

    async fn get_member(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
    ) -> AppResult<Option<ConversationMember>> {
        Ok(self
            .inner
            .lock()
            .await
            .member(conversation_id, user_id)
            .cloned())
    }

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<ConversationMember>> {
        Ok(self
            .inner
            .lock()
            .await
            .members
            .get(&conversation_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        user_id: UserId,
        system_message: NewMessage,
    ) -> AppResult<Message> {
        let mut inner = self.inner.lock().await;
        inner.require_admin(conversation_id, actor)?;
        if inner.member(conversation_id, user_id).is_some() {
            return Err(AppError::AlreadyMember);
        }
        inner.add_member_row(
            conversation_id,
            user_id,
            MemberRole::Member,
            system_message.created_at,
        );
        Ok(inner.insert_message(system_message))
    }

    async fn remove_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        target: UserId,
        system_message: NewMessage,
    ) -> AppResult<Removal> {
        let mut inner = self.inner.lock().await;
        inner.require_admin(conversation_id, actor)?;
        match inner.member(conversation_id, target) {
            None => return Err(AppError::NotMember),
            Some(m) if m.is_admin() => return Err(AppError::PermissionDenied),
            Some(_) => {}
        }
        let members_before = inner.member_ids(conversation_id);
        if let Some(members) = inner.members.get_mut(&conversation_id) {
            members.remove(&target);
        }
        let system_message = inner.insert_message(system_message);
        Ok(Removal {
            members_before,
            system_message,
        })
    }

    async fn leave(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        system_message: NewMessage,
    ) -> AppResult<Removal> {
        let mut inner = self.inner.lock().await;
        inner.conversation(conversation_id)?;
        match inner.member(conversation_id, user_id) {
            None => return Err(AppError::NotMember),
            Some(m) if m.is_admin() => return Err(AppError::AdminMustTransferOrDisband),
            Some(_) => {}
        }
        let members_before = inner.member_ids(conversation_id);
        if let Some(members) = inner.members.get_mut(&conversation_id) {
            members.remove(&user_id);
        }
        let system_message = inner.insert_message(system_message);
        Ok(Removal {
            members_before,
            system_message,
        })
    }

    async fn transfer_admin(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        new_admin: UserId,
    ) -> AppResult<Vec<UserId>> {
        let mut inner = self.inner.lock().await;
        inner.require_admin(conversation_id, actor)?;
        if inner.member(conversation_id, new_admin).is_none() {
            return Err(AppError::NotMember);
        }
        if let Some(members) = inner.members.get_mut(&conversation_id) {
            if let Some(old) = members.get_mut(&actor) {
                old.role = MemberRole::Member;
            }
            if let Some(new) = members.get_mut(&new_admin) {
                new.role = MemberRole::Admin;
            }
        }
        if let Some(conv) = inner.conversations.get_mut(&conversation_id) {
            conv.creator_id = new_admin;
        }
        Ok(inner.member_ids(conversation_id))
    }

    async fn disband(&self, actor: UserId, conversation_id: Uuid) -> AppResult<Vec<UserId>> {
        let mut inner = self.inner.lock().await;
        inner.require_admin(conversation_id, actor)?;
        let member_ids = inner.member_ids(conversation_id);
        inner.remove_conversation(conversation_id);
        Ok(member_ids)
    }

    async fn update_group_info(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        change: GroupInfoChange,
    ) -> AppResult<(Conversation, Option<Message>)> {
        let mut inner = self.inner.lock().await;
        inner.require_admin(conversation_id, actor)?;
        if let Some(conv) = inner.conversations.get_mut(&conversation_id) {
            if let Some(name) = change.name {
                conv.name = name;
            }
            if let Some(avatar) = change.avatar {
                conv.avatar = avatar;
            }
        }
        let message = change.system_message.map(|m| inner.insert_message(m));
        let conv = inner.conversation(conversation_id)?.clone();
        Ok((conv, message))
    }

    async fn append_message(&self, message: NewMessage) -> AppResult<(Message, bool)> {
        let mut inner = self.inner.lock().await;
        inner.conversation(message.conversation_id)?;
        if let Some(sender) = message.sender_id {
            if inner.member(message.conversation_id, sender).is_none() {
                return Err(AppError::NotMember);
            }
        }
        if let Some(client_id) = &message.client_msg_id {
            let existing = inner
                .client_ids
                .get(&(message.conversation_id, client_id.clone()))
                .and_then(|id| inner.messages.get(id));
            if let Some(existing) = existing {
                return Ok((existing.clone(), false));
            }
        }
        Ok((inner.insert_message(message), true))
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        Ok(self.inner.lock().await.messages.get(&id).cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        filter: &MessageFilter,
    ) -> AppResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        let matching: Vec<&Message> = inner
            .ordered_messages(conversation_id)
            .into_iter()
            .filter(|m| match &filter.query {
                Some(q) => !m.is_revoked && contains_ci(&m.content, q),
                None => true,
            })
            .collect();

        let window: Vec<&Message> = match filter.window {
            HistoryWindow::Latest { limit, offset } => {
                let end = matching.len().saturating_sub(offset);
                let start = end.saturating_sub(limit);
                matching[start..end].to_vec()
            }
            HistoryWindow::Before {
                key,
                inclusive,
                limit,
            } => {
                let before: Vec<&Message> = matching
                    .into_iter()
                    .filter(|m| {
                        if inclusive {
                            m.sort_key() <= key
                        } else {
                            m.sort_key() < key
                        }
                    })
                    .collect();
                let start = before.len().saturating_sub(limit);
                before[start..].to_vec()
            }
            HistoryWindow::After { key, limit } => matching
                .into_iter()
                .filter(|m| m.sort_key() > key)
                .take(limit)
                .collect(),
            HistoryWindow::AfterSeq { seq, limit } => {
                let mut after: Vec<&Message> =
                    matching.into_iter().filter(|m| m.seq > seq).collect();
                after.sort_by_key(|m| m.seq);
                after.truncate(limit);
                after.sort_by_key(|m| m.sort_key());
                after
            }
        };
        Ok(window.into_iter().cloned().collect())
    }

    async fn revoke_message(
        &self,
        id: Uuid,
        sender: UserId,
        not_before: DateTime<Utc>,
    ) -> AppResult<Option<Message>> {
        let mut inner = self.inner.lock().await;
        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.sender_id != Some(sender)
            || message.is_revoked
            || message.created_at < not_before
        {
            return Ok(None);
        }
        message.is_revoked = true;
        message.content.clear();
        Ok(Some(message.clone()))
    }

    async fn advance_read_pointer(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        let member = inner
            .members
            .get_mut(&conversation_id)
            .and_then(|m| m.get_mut(&user_id))
            .ok_or(AppError::NotMember)?;
        match member.last_read_msg_time {
            Some(current) if current >= at => Ok(false),
            _ => {
                member.last_read_msg_time = Some(at);
                Ok(true)
            }
        }
    }

    async fn search_messages(
        &self,
        user_id: UserId,
        query: &str,
        page: Page,
    ) -> AppResult<(Vec<Message>, usize)> {
        let inner = self.inner.lock().await;
        let mut hits: Vec<&Message> = inner
            .members
            .iter()
            .filter(|(_, members)| members.contains_key(&user_id))
            .flat_map(|(conv_id, _)| inner.ordered_messages(*conv_id))
            .filter(|m| !m.is_revoked && contains_ci(&m.content, query))
            .collect();
        hits.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        let total = hits.len();
        let items = hits
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn list_visible_conversations(&self, user_id: UserId) -> AppResult<Vec<Conversation>> {
        let inner = self.inner.lock().await;
        let mut convs: Vec<Conversation> = inner
            .members
            .iter()
            .filter(|(_, members)| {
                members
                    .get(&user_id)
                    .map(|m| m.hidden_at.is_none())
                    .unwrap_or(false)
            })
            .filter_map(|(conv_id, _)| inner.conversations.get(conv_id).cloned())
            .collect();
        convs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(convs)
    }

    async fn hide_conversation(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        let member = inner
            .members
            .get_mut(&conversation_id)
            .and_then(|m| m.get_mut(&user_id))
            .ok_or(AppError::NotMember)?;
        let changed = member.hidden_at.is_none();
        member.hidden_at = Some(at);
        Ok(changed)
    }

    async fn group_peer_ids(&self, user_id: UserId) -> AppResult<Vec<UserId>> {
        let inner = self.inner.lock().await;
        let peers: BTreeSet<UserId> = inner
            .members
            .iter()
            .filter(|(conv_id, members)| {
                members.contains_key(&user_id)
                    && inner
                        .conversations
                        .get(conv_id)
                        .map(|c| c.kind == ConversationKind::Group)
                        .unwrap_or(false)
            })
            .flat_map(|(_, members)| members.keys().copied())
            .filter(|id| *id != user_id)
            .collect();
        Ok(peers.into_iter().collect())
    }
}

#[async_trait]
impl FriendStore for InMemoryStore {
    async fn create_request(
        &self,
        sender: UserId,
        receiver: UserId,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<FriendRequest> {
        let mut inner = self.inner.lock().await;
        if inner.friendships.contains(&Friendship::new(sender, receiver)) {
            return Err(AppError::AlreadyFriends);
        }
        if inner
            .requests
            .values()
            .any(|r| r.status == FriendRequestStatus::Pending && r.involves_pair(sender, receiver))
        {
            return Err(AppError::DuplicatePending);
        }
        let request = FriendRequest {
            id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            message: message.to_string(),
            status: FriendRequestStatus::Pending,
            created_at: now,
        };
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: Uuid) -> AppResult<Option<FriendRequest>> {
        Ok(self.inner.lock().await.requests.get(&id).cloned())
    }

    async fn resolve_request(
        &self,
        id: Uuid,
        responder: UserId,
        accept: bool,
    ) -> AppResult<FriendRequest> {
        let mut inner = self.inner.lock().await;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(AppError::NotFound("friend request"))?;
        if request.receiver_id != responder {
            return Err(AppError::NotRequestRecipient);
        }
        if request.status != FriendRequestStatus::Pending {
            return Err(AppError::AlreadyHandled);
        }
        request.status = if accept {
            FriendRequestStatus::Accepted
        } else {
            FriendRequestStatus::Rejected
        };
        let request = request.clone();
        if accept {
            inner
                .friendships
                .insert(Friendship::new(request.sender_id, request.receiver_id));
        }
        Ok(request)
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> AppResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .friendships
            .contains(&Friendship::new(a, b)))
    }

    async fn pending_between(&self, a: UserId, b: UserId) -> AppResult<Option<FriendRequest>> {
        Ok(self
            .inner
            .lock()
            .await
            .requests
            .values()
            .find(|r| r.status == FriendRequestStatus::Pending && r.involves_pair(a, b))
            .cloned())
    }

    async fn list_friend_ids(&self, user_id: UserId) -> AppResult<Vec<UserId>> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<UserId> = inner
            .friendships
            .iter()
            .filter_map(|f| f.other(user_id))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn list_requests(&self, user_id: UserId) -> AppResult<Vec<FriendRequest>> {
        let inner = self.inner.lock().await;
        let mut requests: Vec<FriendRequest> = inner
            .requests
            .values()
            .filter(|r| r.sender_id == user_id || r.receiver_id == user_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn delete_friendship(&self, a: UserId, b: UserId) -> AppResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .friendships
            .remove(&Friendship::new(a, b)))
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn get_user(&self, id: UserId) -> AppResult<Option<UserProfile>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn get_users(&self, ids: &[UserId]) -> AppResult<Vec<UserProfile>> {
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.users.get(id).cloned())
            .collect())
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<UserProfile>> {
        let email = email.trim();
        Ok(self
            .inner
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn search_users(&self, query: &str, limit: usize) -> AppResult<Vec<UserProfile>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .inner
            .lock()
            .await
            .users
            .values()
            .filter(|u| u.matches(query))
            .take(limit)
            .cloned()
            .collect())
    }
}
