use crate::error::AppResult;
use crate::models::UserId;
use crate::store::{ChatStore, FriendStore};
use crate::websocket::StatusAudience;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Friends plus everyone sharing a group with the user.
#[derive(Clone)]
pub struct RelatedUsers {
    chat: Arc<dyn ChatStore>,
    friends: Arc<dyn FriendStore>,
}

impl RelatedUsers {
    pub fn new(chat: Arc<dyn ChatStore>, friends: Arc<dyn FriendStore>) -> Self {
        Self { chat, friends }
    }
}

#[async_trait]
impl StatusAudience for RelatedUsers {
    async fn related_users(&self, user_id: UserId) -> AppResult<Vec<UserId>> {
        let mut related: BTreeSet<UserId> =
            self.friends.list_friend_ids(user_id).await?.into_iter().collect();
        related.extend(self.chat.group_peer_ids(user_id).await?);
        related.remove(&user_id);
        Ok(related.into_iter().collect())
    }
}
