//! Read receipts derived at read time from members' read pointers. Nothing
//! here is persisted.

use crate::config::ReadReceiptPolicy;
use crate::models::{ConversationMember, Message, UserId};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub is_read: bool,
    pub read_count: usize,
    pub can_revoke: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptContext<'a> {
    pub viewer: UserId,
    pub members: &'a [ConversationMember],
    pub policy: ReadReceiptPolicy,
    pub now: DateTime<Utc>,
    pub revoke_window: Duration,
}

/// Members other than the sender whose pointer reached the message.
pub fn read_count(message: &Message, members: &[ConversationMember]) -> usize {
    members
        .iter()
        .filter(|m| Some(m.user_id) != message.sender_id)
        .filter(|m| matches!(m.last_read_msg_time, Some(t) if t >= message.created_at))
        .count()
}

pub fn within_revoke_window(message: &Message, now: DateTime<Utc>, window: Duration) -> bool {
    message.created_at >= now - window
}

pub fn compute(message: &Message, ctx: &ReceiptContext<'_>) -> Receipt {
    let read_count = read_count(message, ctx.members);
    let own = message.sender_id == Some(ctx.viewer);

    let is_read = if own {
        read_count > 0
    } else {
        match ctx.policy {
            ReadReceiptPolicy::FetchImpliesRead => true,
            ReadReceiptPolicy::Explicit => ctx
                .members
                .iter()
                .find(|m| m.user_id == ctx.viewer)
                .and_then(|m| m.last_read_msg_time)
                .map(|t| t >= message.created_at)
                .unwrap_or(false),
        }
    };

    Receipt {
        is_read,
        read_count,
        can_revoke: own
            && !message.is_revoked
            && within_revoke_window(message, ctx.now, ctx.revoke_window),
    }
}
