use super::read_receipts::{self, ReceiptContext};
use super::{conversation_view, is_online, Outcome};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationKind, ConversationMember, ConversationView, Message, MessageKind,
    MessageView, NewMessage, Page, Paged, SearchHit, UserId,
};
use crate::presence::PresenceStore;
use crate::store::{ChatStore, HistoryWindow, MessageFilter, UserDirectory};
use crate::websocket::{ChatEvent, Notification};
use chrono::Duration;
use mockable::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Default page size for history and context reads.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub kind: MessageKind,
    pub content: String,
    pub client_msg_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub before_id: Option<Uuid>,
    pub after_id: Option<Uuid>,
    pub after_seq: Option<i64>,
}

#[derive(Clone)]
pub struct MessagingService {
    store: Arc<dyn ChatStore>,
    users: Arc<dyn UserDirectory>,
    presence: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        users: Arc<dyn UserDirectory>,
        presence: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            users,
            presence,
            clock,
            config,
        }
    }

    fn revoke_window(&self) -> Duration {
        Duration::seconds(self.config.revoke_window_secs)
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Conversation> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or(AppError::NotFound("conversation"))
    }

    async fn require_member(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
    ) -> AppResult<ConversationMember> {
        self.conversation(conversation_id).await?;
        self.store
            .get_member(conversation_id, user_id)
            .await?
            .ok_or(AppError::NotMember)
    }

    async fn member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<UserId>> {
        Ok(self
            .store
            .list_members(conversation_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect())
    }

    /// Message in the given conversation, or `NotFound`.
    async fn message_in(&self, conversation_id: Uuid, message_id: Uuid) -> AppResult<Message> {
        self.store
            .get_message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(AppError::NotFound("message"))
    }

    pub async fn send_message(
        &self,
        sender: UserId,
        conversation_id: Uuid,
        req: SendMessage,
    ) -> AppResult<Outcome<Message>> {
        if req.kind == MessageKind::System {
            return Err(AppError::BadRequest(
                "system messages cannot be sent by users".into(),
            ));
        }
        if req.kind == MessageKind::Text && req.content.trim().is_empty() {
            return Err(AppError::BadRequest("message content is empty".into()));
        }
        self.require_member(conversation_id, sender).await?;

        let client_msg_id = req
            .client_msg_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        let (message, created) = self
            .store
            .append_message(NewMessage {
                conversation_id,
                sender_id: Some(sender),
                kind: req.kind,
                content: req.content,
                client_msg_id,
                created_at: self.clock.utc(),
            })
            .await?;

        if !created {
            debug!(
                message_id = %message.id,
                %conversation_id,
                "duplicate client message id, returning stored message"
            );
            return Ok(Outcome::new(message));
        }

        info!(message_id = %message.id, %conversation_id, sender, "message sent");
        let members = self.member_ids(conversation_id).await?;
        let event = ChatEvent::new_message(message.clone());
        Ok(Outcome::with(
            message,
            vec![Notification::to_users(members, event)],
        ))
    }

    pub async fn get_history(
        &self,
        viewer: UserId,
        conversation_id: Uuid,
        query: HistoryQuery,
    ) -> AppResult<Vec<MessageView>> {
        self.require_member(conversation_id, viewer).await?;
        let limit = Page::new(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT), 0).limit;

        let window = if let Some(before_id) = query.before_id {
            let cursor = self.message_in(conversation_id, before_id).await?;
            HistoryWindow::Before {
                key: cursor.sort_key(),
                inclusive: false,
                limit,
            }
        } else if let Some(after_id) = query.after_id {
            let cursor = self.message_in(conversation_id, after_id).await?;
            HistoryWindow::After {
                key: cursor.sort_key(),
                limit,
            }
        } else if let Some(seq) = query.after_seq {
            HistoryWindow::AfterSeq { seq, limit }
        } else {
            HistoryWindow::Latest {
                limit,
                offset: query.offset,
            }
        };

        let filter = MessageFilter {
            query: query
                .query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty()),
            window,
        };
        let messages = self.store.list_messages(conversation_id, &filter).await?;
        self.render(viewer, conversation_id, messages).await
    }

    /// Messages around a target: up to `limit / 2` at or before it and the
    /// rest after it.
    pub async fn get_message_context(
        &self,
        viewer: UserId,
        message_id: Uuid,
        limit: Option<usize>,
    ) -> AppResult<Vec<MessageView>> {
        let target = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound("message"))?;
        self.require_member(target.conversation_id, viewer).await?;

        // at least two so the target itself is always part of the window
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(2, Page::MAX_LIMIT);
        let half = limit / 2;

        let before = MessageFilter {
            query: None,
            window: HistoryWindow::Before {
                key: target.sort_key(),
                inclusive: true,
                limit: half,
            },
        };
        let after = MessageFilter {
            query: None,
            window: HistoryWindow::After {
                key: target.sort_key(),
                limit: limit - half,
            },
        };
        let mut messages = self
            .store
            .list_messages(target.conversation_id, &before)
            .await?;
        messages.extend(
            self.store
                .list_messages(target.conversation_id, &after)
                .await?,
        );
        self.render(viewer, target.conversation_id, messages).await
    }

    pub async fn revoke_message(
        &self,
        user: UserId,
        message_id: Uuid,
    ) -> AppResult<Outcome<Message>> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound("message"))?;
        if message.sender_id != Some(user) {
            return Err(AppError::PermissionDenied);
        }
        if message.is_revoked {
            return Ok(Outcome::new(message));
        }

        let now = self.clock.utc();
        let window = self.revoke_window();
        if !read_receipts::within_revoke_window(&message, now, window) {
            return Err(AppError::RevokeWindowExpired {
                window_secs: self.config.revoke_window_secs,
            });
        }

        let Some(revoked) = self
            .store
            .revoke_message(message_id, user, now - window)
            .await?
        else {
            // lost a race: either someone revoked it first or the window closed
            return match self.store.get_message(message_id).await? {
                Some(m) if m.is_revoked => Ok(Outcome::new(m)),
                Some(_) => Err(AppError::RevokeWindowExpired {
                    window_secs: self.config.revoke_window_secs,
                }),
                None => Err(AppError::NotFound("message")),
            };
        };

        info!(%message_id, conversation_id = %revoked.conversation_id, user, "message revoked");
        let members = self.member_ids(revoked.conversation_id).await?;
        let event = ChatEvent::MessageRevoke {
            conversation_id: revoked.conversation_id,
            message_id,
            sender_id: user,
        };
        Ok(Outcome::with(
            revoked,
            vec![Notification::to_users(members, event)],
        ))
    }

    /// Moves the caller's read pointer up to the message. The flag is false
    /// when the pointer was already there or further.
    pub async fn mark_as_read(
        &self,
        user: UserId,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<Outcome<bool>> {
        self.require_member(conversation_id, user).await?;
        let message = self.message_in(conversation_id, message_id).await?;

        let moved = self
            .store
            .advance_read_pointer(conversation_id, user, message.created_at)
            .await?;
        if !moved {
            return Ok(Outcome::new(false));
        }

        debug!(%conversation_id, %message_id, user, "read pointer advanced");
        let members = self.member_ids(conversation_id).await?;
        let event = ChatEvent::MessageRead {
            conversation_id,
            user_id: user,
            message_id,
        };
        Ok(Outcome::with(
            true,
            vec![Notification::to_users_except(&members, user, event)],
        ))
    }

    pub async fn global_search(
        &self,
        user: UserId,
        query: &str,
        page: Page,
    ) -> AppResult<Paged<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Paged {
                items: Vec::new(),
                total: 0,
            });
        }

        let (messages, total) = self.store.search_messages(user, query, page).await?;
        let mut views: HashMap<Uuid, ConversationView> = HashMap::new();
        let mut items = Vec::with_capacity(messages.len());
        for message in messages {
            if !views.contains_key(&message.conversation_id) {
                let Some(conv) = self.store.get_conversation(message.conversation_id).await?
                else {
                    continue;
                };
                let view =
                    conversation_view(&self.store, &self.users, &self.presence, &conv, user)
                        .await?;
                views.insert(conv.id, view);
            }
            if let Some(view) = views.get(&message.conversation_id) {
                items.push(SearchHit {
                    conversation_type: view.kind,
                    conversation_name: view.name.clone(),
                    conversation_avatar: view.avatar.clone(),
                    message,
                });
            }
        }
        Ok(Paged { items, total })
    }

    pub async fn get_or_create_private_chat(
        &self,
        user: UserId,
        peer: UserId,
    ) -> AppResult<ConversationView> {
        if user == peer {
            return Err(AppError::BadRequest(
                "cannot start a private chat with yourself".into(),
            ));
        }
        if self.users.get_user(peer).await?.is_none() {
            return Err(AppError::NotFound("user"));
        }
        let conv = self
            .store
            .get_or_create_private(user, peer, self.clock.utc())
            .await?;
        debug!(conversation_id = %conv.id, user, peer, "private chat resolved");
        conversation_view(&self.store, &self.users, &self.presence, &conv, user).await
    }

    /// Visible conversations, most recently active first. `query` filters on
    /// the displayed name.
    pub async fn list_conversations(
        &self,
        user: UserId,
        query: Option<&str>,
        page: Page,
    ) -> AppResult<Paged<ConversationView>> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let mut views = Vec::new();
        for conv in self.store.list_visible_conversations(user).await? {
            let view =
                conversation_view(&self.store, &self.users, &self.presence, &conv, user).await?;
            let keep = query
                .map(|q| crate::store::contains_ci(&view.name, q))
                .unwrap_or(true);
            if keep {
                views.push(view);
            }
        }
        let total = views.len();
        let items = views
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Paged { items, total })
    }

    /// Hides the conversation from the caller's list until the next message.
    pub async fn hide_conversation(&self, user: UserId, conversation_id: Uuid) -> AppResult<bool> {
        self.conversation(conversation_id).await?;
        self.store
            .hide_conversation(conversation_id, user, self.clock.utc())
            .await
    }

    /// Typing indicator. Only forwarded in private chats the caller belongs
    /// to; anything else is ignored.
    pub async fn typing(&self, user: UserId, conversation_id: Uuid) -> AppResult<Outcome<()>> {
        let Some(conv) = self.store.get_conversation(conversation_id).await? else {
            return Ok(Outcome::new(()));
        };
        if conv.kind != ConversationKind::Private {
            return Ok(Outcome::new(()));
        }
        let members = self.member_ids(conversation_id).await?;
        if !members.contains(&user) {
            debug!(user, %conversation_id, "typing from non-member ignored");
            return Ok(Outcome::new(()));
        }
        let event = ChatEvent::Typing {
            conversation_id,
            user_id: user,
        };
        Ok(Outcome::with(
            (),
            vec![Notification::to_users_except(&members, user, event)],
        ))
    }

    async fn render(
        &self,
        viewer: UserId,
        conversation_id: Uuid,
        messages: Vec<Message>,
    ) -> AppResult<Vec<MessageView>> {
        let members = self.store.list_members(conversation_id).await?;
        let ctx = ReceiptContext {
            viewer,
            members: &members,
            policy: self.config.read_receipts,
            now: self.clock.utc(),
            revoke_window: self.revoke_window(),
        };

        let mut online: HashMap<UserId, bool> = HashMap::new();
        let mut views = Vec::with_capacity(messages.len());
        for message in messages {
            let receipt = read_receipts::compute(&message, &ctx);
            let sender_online = match message.sender_id {
                Some(sender) => match online.get(&sender) {
                    Some(v) => *v,
                    None => {
                        let v = is_online(&self.presence, sender).await;
                        online.insert(sender, v);
                        v
                    }
                },
                None => false,
            };
            views.push(MessageView {
                message,
                is_read: receipt.is_read,
                read_count: receipt.read_count,
                can_revoke: receipt.can_revoke,
                is_online: sender_online,
            });
        }
        Ok(views)
    }
}
