//! Business operations. Services validate, call the store, and return the
//! notifications the gateway should push once the write has committed; they
//! never touch sockets themselves.

use crate::error::AppResult;
use crate::models::{Conversation, ConversationKind, ConversationView, UserId, UserProfile};
use crate::presence::PresenceStore;
use crate::store::{ChatStore, UserDirectory};
use crate::websocket::Notification;
use std::sync::Arc;

pub mod friendship_service;
pub mod group_service;
pub mod messaging;
pub mod presence_audience;
pub mod read_receipts;

pub use friendship_service::FriendshipService;
pub use group_service::GroupService;
pub use messaging::MessagingService;
pub use presence_audience::RelatedUsers;

/// Result of a mutating operation plus the events it produced.
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub notifications: Vec<Notification>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            notifications: Vec::new(),
        }
    }

    pub fn with(value: T, notifications: Vec<Notification>) -> Self {
        Self {
            value,
            notifications,
        }
    }
}

/// Presence lookup that degrades to "offline" when the cache is down.
pub(crate) async fn is_online(presence: &Arc<dyn PresenceStore>, user_id: UserId) -> bool {
    match presence.is_online(user_id).await {
        Ok(online) => online,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "presence lookup failed");
            false
        }
    }
}

/// Name used for a user inside system messages.
pub(crate) fn display_name(profile: Option<&UserProfile>, user_id: UserId) -> String {
    match profile {
        Some(p) if !p.name.trim().is_empty() => p.name.clone(),
        _ => format!("user {user_id}"),
    }
}

/// Renders a conversation for one viewer. Private chats show the peer.
pub(crate) async fn conversation_view(
    store: &Arc<dyn ChatStore>,
    users: &Arc<dyn UserDirectory>,
    presence: &Arc<dyn PresenceStore>,
    conv: &Conversation,
    viewer: UserId,
) -> AppResult<ConversationView> {
    let member_ids: Vec<UserId> = store
        .list_members(conv.id)
        .await?
        .into_iter()
        .map(|m| m.user_id)
        .collect();

    let mut view = ConversationView {
        id: conv.id,
        kind: conv.kind,
        name: conv.name.clone(),
        avatar: conv.avatar.clone(),
        creator_id: conv.creator_id,
        member_ids,
        peer_id: None,
        is_online: false,
        updated_at: conv.updated_at,
    };

    if conv.kind == ConversationKind::Private {
        if let Some(peer) = view.member_ids.iter().copied().find(|id| *id != viewer) {
            let profile = users.get_user(peer).await?;
            view.name = display_name(profile.as_ref(), peer);
            view.avatar = profile.map(|p| p.avatar).unwrap_or_default();
            view.is_online = is_online(presence, peer).await;
            view.peer_id = Some(peer);
        }
    }
    Ok(view)
}
