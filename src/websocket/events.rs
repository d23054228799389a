use crate::models::{Message, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a member left a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    Kicked,
    Left,
}

/// Presence transition pushed to a user's friends and group peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Outbound events, serialized as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatEvent {
    NewMessage(Box<Message>),
    #[serde(rename_all = "camelCase")]
    MessageRevoke {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        conversation_id: Uuid,
        user_id: UserId,
        message_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    MemberLeft {
        conversation_id: Uuid,
        user_id: UserId,
        reason: LeaveReason,
    },
    #[serde(rename_all = "camelCase")]
    GroupDisbanded { conversation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    GroupInfoUpdated {
        conversation_id: Uuid,
        name: String,
        avatar: String,
    },
    #[serde(rename_all = "camelCase")]
    AdminTransferred {
        conversation_id: Uuid,
        old_admin_id: UserId,
        new_admin_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: Uuid,
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
    },
}

impl ChatEvent {
    pub fn new_message(message: Message) -> Self {
        Self::NewMessage(Box::new(message))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "NEW_MESSAGE",
            Self::MessageRevoke { .. } => "MESSAGE_REVOKE",
            Self::MessageRead { .. } => "MESSAGE_READ",
            Self::MemberLeft { .. } => "MEMBER_LEFT",
            Self::GroupDisbanded { .. } => "GROUP_DISBANDED",
            Self::GroupInfoUpdated { .. } => "GROUP_INFO_UPDATED",
            Self::AdminTransferred { .. } => "ADMIN_TRANSFERRED",
            Self::Typing { .. } => "TYPING",
            Self::UserStatus { .. } => "USER_STATUS",
        }
    }
}

/// Inbound WebSocket frames from clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsInboundEvent {
    #[serde(rename_all = "camelCase")]
    Typing { conversation_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recipients {
    Users(Vec<UserId>),
    Everyone,
}

/// An event plus who should receive it. Services return these; the gateway
/// hands them to the hub after the store write has committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipients: Recipients,
    pub event: ChatEvent,
}

impl Notification {
    pub fn to_users(users: Vec<UserId>, event: ChatEvent) -> Self {
        Self {
            recipients: Recipients::Users(users),
            event,
        }
    }

    /// Same as [`Notification::to_users`] minus one user.
    pub fn to_users_except(users: &[UserId], except: UserId, event: ChatEvent) -> Self {
        let users = users.iter().copied().filter(|u| *u != except).collect();
        Self::to_users(users, event)
    }

    pub fn to_everyone(event: ChatEvent) -> Self {
        Self {
            recipients: Recipients::Everyone,
            event,
        }
    }

    pub fn recipient_ids(&self) -> &[UserId] {
        match &self.recipients {
            Recipients::Users(ids) => ids,
            Recipients::Everyone => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn revoke_event_uses_adjacent_tagging() {
        let conv = Uuid::new_v4();
        let msg = Uuid::new_v4();
        let event = ChatEvent::MessageRevoke {
            conversation_id: conv,
            message_id: msg,
            sender_id: 7,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "MESSAGE_REVOKE",
                "data": {"conversationId": conv, "messageId": msg, "senderId": 7}
            })
        );
        assert_eq!(event.name(), "MESSAGE_REVOKE");
    }

    #[test]
    fn member_left_reason_is_lowercase() {
        let value = serde_json::to_value(ChatEvent::MemberLeft {
            conversation_id: Uuid::nil(),
            user_id: 3,
            reason: LeaveReason::Kicked,
        })
        .unwrap();
        assert_eq!(value["type"], "MEMBER_LEFT");
        assert_eq!(value["data"]["reason"], "kicked");
        assert_eq!(value["data"]["userId"], 3);
    }

    #[test]
    fn new_message_carries_the_message_as_data() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: None,
            kind: MessageKind::System,
            content: "A created the group".into(),
            client_msg_id: None,
            created_at: Utc::now(),
            seq: 1,
            is_revoked: false,
        };
        let value = serde_json::to_value(ChatEvent::new_message(message)).unwrap();
        assert_eq!(value["type"], "NEW_MESSAGE");
        assert_eq!(value["data"]["type"], "system");
        assert_eq!(value["data"]["content"], "A created the group");
    }

    #[test]
    fn user_status_is_lowercase() {
        let value = serde_json::to_value(ChatEvent::UserStatus {
            user_id: 5,
            status: PresenceStatus::Offline,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "USER_STATUS", "data": {"userId": 5, "status": "offline"}})
        );
    }

    #[test]
    fn inbound_typing_parses() {
        let conv = Uuid::new_v4();
        let raw = format!(r#"{{"type":"TYPING","data":{{"conversationId":"{conv}"}}}}"#);
        let event: WsInboundEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event, WsInboundEvent::Typing { conversation_id: conv });
    }

    #[test]
    fn except_filters_one_user() {
        let n = Notification::to_users_except(&[1, 2, 3], 2, ChatEvent::GroupDisbanded {
            conversation_id: Uuid::nil(),
        });
        assert_eq!(n.recipient_ids(), &[1, 3]);
    }
}
