//! Postgres-backed store.
//!
//! Membership mutations lock the conversation row (`FOR UPDATE`) and sends
//! take a shared lock on it, so a kick and a send, or a kick and a leave,
//! never interleave between their checks and their writes.

use super::{
    pair_key, ChatStore, FriendStore, GroupInfoChange, HistoryWindow, MessageFilter, NewGroup,
    Removal, UserDirectory,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationKind, ConversationMember, FriendRequest, FriendRequestStatus,
    Friendship, MemberRole, Message, MessageKind, NewMessage, Page, UserId, UserProfile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, kind, name, avatar, creator_id, created_at, updated_at";
const MEMBER_COLUMNS: &str =
    "conversation_id, user_id, role, last_read_msg_time, hidden_at, joined_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, kind, content, client_msg_id, created_at, seq, is_revoked";
const REQUEST_COLUMNS: &str = "id, sender_id, receiver_id, message, status, created_at";
const USER_COLUMNS: &str = "id, name, email, avatar";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn corrupt(column: &str, value: &str) -> AppError {
    tracing::error!(column, value, "unexpected value in database row");
    AppError::Internal
}

fn conversation_from_row(row: &Row) -> AppResult<Conversation> {
    let kind: String = row.get("kind");
    Ok(Conversation {
        id: row.get("id"),
        kind: ConversationKind::from_db(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        name: row.get("name"),
        avatar: row.get("avatar"),
        creator_id: row.get("creator_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn member_from_row(row: &Row) -> AppResult<ConversationMember> {
    let role: String = row.get("role");
    Ok(ConversationMember {
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        role: MemberRole::from_db(&role).ok_or_else(|| corrupt("role", &role))?,
        last_read_msg_time: row.get("last_read_msg_time"),
        hidden_at: row.get("hidden_at"),
        joined_at: row.get("joined_at"),
    })
}

fn message_from_row(row: &Row) -> AppResult<Message> {
    let kind: String = row.get("kind");
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        kind: MessageKind::from_db(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        content: row.get("content"),
        client_msg_id: row.get("client_msg_id"),
        created_at: row.get("created_at"),
        seq: row.get("seq"),
        is_revoked: row.get("is_revoked"),
    })
}

fn request_from_row(row: &Row) -> AppResult<FriendRequest> {
    let status: String = row.get("status");
    Ok(FriendRequest {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        message: row.get("message"),
        status: FriendRequestStatus::from_db(&status).ok_or_else(|| corrupt("status", &status))?,
        created_at: row.get("created_at"),
    })
}

fn user_from_row(row: &Row) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        avatar: row.get("avatar"),
    }
}

/// `ILIKE` pattern matching `query` literally anywhere in the column.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn private_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = pair_key(a, b);
    format!("{lo}:{hi}")
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Locks the conversation row for the rest of the transaction.
async fn lock_conversation(tx: &Transaction<'_>, id: Uuid) -> AppResult<Conversation> {
    let row = tx
        .query_opt(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1 FOR UPDATE"),
            &[&id],
        )
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    conversation_from_row(&row)
}

async fn member_role(
    tx: &Transaction<'_>,
    conversation_id: Uuid,
    user_id: UserId,
) -> AppResult<Option<MemberRole>> {
    let row = tx
        .query_opt(
            "SELECT role FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
            &[&conversation_id, &user_id],
        )
        .await?;
    match row {
        None => Ok(None),
        Some(row) => {
            let role: String = row.get(0);
            MemberRole::from_db(&role)
                .map(Some)
                .ok_or_else(|| corrupt("role", &role))
        }
    }
}

async fn require_admin(tx: &Transaction<'_>, conversation_id: Uuid, actor: UserId) -> AppResult<()> {
    lock_conversation(tx, conversation_id).await?;
    match member_role(tx, conversation_id, actor).await? {
        None => Err(AppError::NotMember),
        Some(role) if !role.is_admin() => Err(AppError::PermissionDenied),
        Some(_) => Ok(()),
    }
}

async fn member_ids(tx: &Transaction<'_>, conversation_id: Uuid) -> AppResult<Vec<UserId>> {
    let rows = tx
        .query(
            "SELECT user_id FROM conversation_members WHERE conversation_id = $1 ORDER BY user_id",
            &[&conversation_id],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Inserts a message and touches the conversation. Returns `None` when the
/// client message id is already taken.
async fn insert_message(tx: &Transaction<'_>, new: &NewMessage) -> AppResult<Option<Message>> {
    let id = Uuid::new_v4();
    let kind = new.kind.to_db();
    let row = tx
        .query_opt(
            &format!(
                "INSERT INTO messages (id, conversation_id, sender_id, kind, content, client_msg_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (conversation_id, client_msg_id) WHERE client_msg_id IS NOT NULL DO NOTHING
                 RETURNING {MESSAGE_COLUMNS}"
            ),
            &[
                &id,
                &new.conversation_id,
                &new.sender_id,
                &kind,
                &new.content,
                &new.client_msg_id,
                &new.created_at,
            ],
        )
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    tx.execute(
        "UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1",
        &[&new.conversation_id, &new.created_at],
    )
    .await?;
    tx.execute(
        "UPDATE conversation_members SET hidden_at = NULL WHERE conversation_id = $1 AND hidden_at IS NOT NULL",
        &[&new.conversation_id],
    )
    .await?;

    message_from_row(&row).map(Some)
}

async fn insert_system_message(tx: &Transaction<'_>, new: &NewMessage) -> AppResult<Message> {
    insert_message(tx, new).await?.ok_or(AppError::Internal)
}

async fn insert_member(
    tx: &Transaction<'_>,
    conversation_id: Uuid,
    user_id: UserId,
    role: MemberRole,
    now: DateTime<Utc>,
) -> AppResult<u64> {
    Ok(tx
        .execute(
            "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            &[&conversation_id, &user_id, &role.to_db(), &now],
        )
        .await?)
}

#[async_trait]
impl ChatStore for PgStore {
    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"),
                &[&id],
            )
            .await?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn find_private_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE private_key = $1"),
                &[&private_key(a, b)],
            )
            .await?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn get_or_create_private(
        &self,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> AppResult<Conversation> {
        let key = private_key(a, b);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let id = Uuid::new_v4();
        let created = tx
            .query_opt(
                "INSERT INTO conversations (id, kind, creator_id, private_key, created_at, updated_at)
                 VALUES ($1, 'private', $2, $3, $4, $4)
                 ON CONFLICT (private_key) DO NOTHING
                 RETURNING id",
                &[&id, &a, &key, &now],
            )
            .await?;
        if created.is_some() {
            insert_member(&tx, id, a, MemberRole::Member, now).await?;
            insert_member(&tx, id, b, MemberRole::Member, now).await?;
        }

        let row = tx
            .query_one(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE private_key = $1"),
                &[&key],
            )
            .await?;
        tx.commit().await?;
        conversation_from_row(&row)
    }

    async fn create_group(
        &self,
        group: NewGroup,
        system_message: NewMessage,
    ) -> AppResult<(Conversation, Message)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            "INSERT INTO conversations (id, kind, name, creator_id, created_at, updated_at)
             VALUES ($1, 'group', $2, $3, $4, $4)",
            &[&group.id, &group.name, &group.creator_id, &group.created_at],
        )
        .await?;
        insert_member(&tx, group.id, group.creator_id, MemberRole::Admin, group.created_at).await?;
        for user_id in &group.member_ids {
            insert_member(&tx, group.id, *user_id, MemberRole::Member, group.created_at).await?;
        }
        let message = insert_system_message(&tx, &system_message).await?;
        let conv = lock_conversation(&tx, group.id).await?;
        tx.commit().await?;
        Ok((conv, message))
    }

    async fn get_member(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
    ) -> AppResult<Option<ConversationMember>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!(
                    "SELECT {MEMBER_COLUMNS} FROM conversation_members
                     WHERE conversation_id = $1 AND user_id = $2"
                ),
                &[&conversation_id, &user_id],
            )
            .await?
            .as_ref()
            .map(member_from_row)
            .transpose()
    }

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<ConversationMember>> {
        let client = self.pool.get().await?;
        client
            .query(
                &format!(
                    "SELECT {MEMBER_COLUMNS} FROM conversation_members
                     WHERE conversation_id = $1 ORDER BY user_id"
                ),
                &[&conversation_id],
            )
            .await?
            .iter()
            .map(member_from_row)
            .collect()
    }

    async fn add_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        user_id: UserId,
        system_message: NewMessage,
    ) -> AppResult<Message> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        require_admin(&tx, conversation_id, actor).await?;
        let inserted = insert_member(
            &tx,
            conversation_id,
            user_id,
            MemberRole::Member,
            system_message.created_at,
        )
        .await?;
        if inserted == 0 {
            return Err(AppError::AlreadyMember);
        }
        let message = insert_system_message(&tx, &system_message).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn remove_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        target: UserId,
        system_message: NewMessage,
    ) -> AppResult<Removal> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        require_admin(&tx, conversation_id, actor).await?;
        match member_role(&tx, conversation_id, target).await? {
            None => return Err(AppError::NotMember),
            Some(role) if role.is_admin() => return Err(AppError::PermissionDenied),
            Some(_) => {}
        }
        let members_before = member_ids(&tx, conversation_id).await?;
        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
            &[&conversation_id, &target],
        )
        .await?;
        let system_message = insert_system_message(&tx, &system_message).await?;
        tx.commit().await?;
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
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        lock_conversation(&tx, conversation_id).await?;
        match member_role(&tx, conversation_id, user_id).await? {
            None => return Err(AppError::NotMember),
            Some(role) if role.is_admin() => return Err(AppError::AdminMustTransferOrDisband),
            Some(_) => {}
        }
        let members_before = member_ids(&tx, conversation_id).await?;
        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
            &[&conversation_id, &user_id],
        )
        .await?;
        let system_message = insert_system_message(&tx, &system_message).await?;
        tx.commit().await?;
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
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        require_admin(&tx, conversation_id, actor).await?;
        if member_role(&tx, conversation_id, new_admin).await?.is_none() {
            return Err(AppError::NotMember);
        }
        // demote first: the partial unique index allows one admin per conversation
        tx.execute(
            "UPDATE conversation_members SET role = 'member' WHERE conversation_id = $1 AND user_id = $2",
            &[&conversation_id, &actor],
        )
        .await?;
        tx.execute(
            "UPDATE conversation_members SET role = 'admin' WHERE conversation_id = $1 AND user_id = $2",
            &[&conversation_id, &new_admin],
        )
        .await?;
        tx.execute(
            "UPDATE conversations SET creator_id = $2 WHERE id = $1",
            &[&conversation_id, &new_admin],
        )
        .await?;
        let ids = member_ids(&tx, conversation_id).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn disband(&self, actor: UserId, conversation_id: Uuid) -> AppResult<Vec<UserId>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        require_admin(&tx, conversation_id, actor).await?;
        let ids = member_ids(&tx, conversation_id).await?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = $1",
            &[&conversation_id],
        )
        .await?;
        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = $1",
            &[&conversation_id],
        )
        .await?;
        tx.execute("DELETE FROM conversations WHERE id = $1", &[&conversation_id])
            .await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn update_group_info(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        change: GroupInfoChange,
    ) -> AppResult<(Conversation, Option<Message>)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        require_admin(&tx, conversation_id, actor).await?;
        tx.execute(
            "UPDATE conversations SET name = COALESCE($2, name), avatar = COALESCE($3, avatar)
             WHERE id = $1",
            &[&conversation_id, &change.name, &change.avatar],
        )
        .await?;
        let message = match &change.system_message {
            Some(m) => Some(insert_system_message(&tx, m).await?),
            None => None,
        };
        let conv = lock_conversation(&tx, conversation_id).await?;
        tx.commit().await?;
        Ok((conv, message))
    }

    async fn append_message(&self, message: NewMessage) -> AppResult<(Message, bool)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.query_opt(
            "SELECT id FROM conversations WHERE id = $1 FOR SHARE",
            &[&message.conversation_id],
        )
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
        if let Some(sender) = message.sender_id {
            if member_role(&tx, message.conversation_id, sender)
                .await?
                .is_none()
            {
                return Err(AppError::NotMember);
            }
        }

        if let Some(stored) = insert_message(&tx, &message).await? {
            tx.commit().await?;
            return Ok((stored, true));
        }

        let row = tx
            .query_one(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = $1 AND client_msg_id = $2"
                ),
                &[&message.conversation_id, &message.client_msg_id],
            )
            .await?;
        tx.commit().await?;
        Ok((message_from_row(&row)?, false))
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"),
                &[&id],
            )
            .await?
            .as_ref()
            .map(message_from_row)
            .transpose()
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        filter: &MessageFilter,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let pattern = filter.query.as_deref().map(like_pattern);
        let base = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = $1
               AND ($2::text IS NULL OR (NOT is_revoked AND content ILIKE $2 ESCAPE '\\'))"
        );

        let (rows, newest_first) = match filter.window {
            HistoryWindow::Latest { limit, offset } => {
                let sql = format!("{base} ORDER BY created_at DESC, seq DESC LIMIT $3 OFFSET $4");
                let params: [&(dyn ToSql + Sync); 4] =
                    [&conversation_id, &pattern, &to_i64(limit), &to_i64(offset)];
                (client.query(&sql, &params).await?, true)
            }
            HistoryWindow::Before {
                key: (at, seq),
                inclusive,
                limit,
            } => {
                let op = if inclusive { "<=" } else { "<" };
                let sql = format!(
                    "{base} AND (created_at, seq) {op} ($3, $4)
                     ORDER BY created_at DESC, seq DESC LIMIT $5"
                );
                let params: [&(dyn ToSql + Sync); 5] =
                    [&conversation_id, &pattern, &at, &seq, &to_i64(limit)];
                (client.query(&sql, &params).await?, true)
            }
            HistoryWindow::After {
                key: (at, seq),
                limit,
            } => {
                let sql = format!(
                    "{base} AND (created_at, seq) > ($3, $4)
                     ORDER BY created_at ASC, seq ASC LIMIT $5"
                );
                let params: [&(dyn ToSql + Sync); 5] =
                    [&conversation_id, &pattern, &at, &seq, &to_i64(limit)];
                (client.query(&sql, &params).await?, false)
            }
            HistoryWindow::AfterSeq { seq, limit } => {
                let sql = format!("{base} AND seq > $3 ORDER BY seq ASC LIMIT $4");
                let params: [&(dyn ToSql + Sync); 4] =
                    [&conversation_id, &pattern, &seq, &to_i64(limit)];
                (client.query(&sql, &params).await?, false)
            }
        };

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        if newest_first {
            messages.reverse();
        } else {
            messages.sort_by_key(|m| m.sort_key());
        }
        Ok(messages)
    }

    async fn revoke_message(
        &self,
        id: Uuid,
        sender: UserId,
        not_before: DateTime<Utc>,
    ) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!(
                    "UPDATE messages SET is_revoked = TRUE, content = ''
                     WHERE id = $1 AND sender_id = $2 AND NOT is_revoked AND created_at >= $3
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                &[&id, &sender, &not_before],
            )
            .await?
            .as_ref()
            .map(message_from_row)
            .transpose()
    }

    async fn advance_read_pointer(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE conversation_members SET last_read_msg_time = $3
                 WHERE conversation_id = $1 AND user_id = $2
                   AND (last_read_msg_time IS NULL OR last_read_msg_time < $3)",
                &[&conversation_id, &user_id, &at],
            )
            .await?;
        if updated > 0 {
            return Ok(true);
        }
        let exists = client
            .query_opt(
                "SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
                &[&conversation_id, &user_id],
            )
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(AppError::NotMember)
        }
    }

    async fn search_messages(
        &self,
        user_id: UserId,
        query: &str,
        page: Page,
    ) -> AppResult<(Vec<Message>, usize)> {
        let client = self.pool.get().await?;
        let pattern = like_pattern(query);
        let scope = "FROM messages
             WHERE conversation_id IN (SELECT conversation_id FROM conversation_members WHERE user_id = $1)
               AND NOT is_revoked AND content ILIKE $2 ESCAPE '\\'";

        let total: i64 = client
            .query_one(&format!("SELECT COUNT(*) {scope}"), &[&user_id, &pattern])
            .await?
            .get(0);
        let rows = client
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} {scope}
                     ORDER BY created_at DESC, seq DESC LIMIT $3 OFFSET $4"
                ),
                &[
                    &user_id,
                    &pattern,
                    &to_i64(page.limit),
                    &to_i64(page.offset),
                ],
            )
            .await?;
        let items = rows
            .iter()
            .map(message_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        Ok((items, usize::try_from(total).unwrap_or_default()))
    }

    async fn list_visible_conversations(&self, user_id: UserId) -> AppResult<Vec<Conversation>> {
        let client = self.pool.get().await?;
        client
            .query(
                "SELECT c.id, c.kind, c.name, c.avatar, c.creator_id, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_members cm ON cm.conversation_id = c.id
                 WHERE cm.user_id = $1 AND cm.hidden_at IS NULL
                 ORDER BY c.updated_at DESC, c.id",
                &[&user_id],
            )
            .await?
            .iter()
            .map(conversation_from_row)
            .collect()
    }

    async fn hide_conversation(
        &self,
        conversation_id: Uuid,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE conversation_members SET hidden_at = COALESCE(hidden_at, $3)
                 WHERE conversation_id = $1 AND user_id = $2
                 RETURNING hidden_at = $3",
                &[&conversation_id, &user_id, &at],
            )
            .await?
            .ok_or(AppError::NotMember)?;
        Ok(row.get(0))
    }

    async fn group_peer_ids(&self, user_id: UserId) -> AppResult<Vec<UserId>> {
        let client = self.pool.get().await?;
        Ok(client
            .query(
                "SELECT DISTINCT peer.user_id
                 FROM conversation_members me
                 JOIN conversations c ON c.id = me.conversation_id AND c.kind = 'group'
                 JOIN conversation_members peer ON peer.conversation_id = me.conversation_id
                 WHERE me.user_id = $1 AND peer.user_id <> $1
                 ORDER BY peer.user_id",
                &[&user_id],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect())
    }
}

#[async_trait]
impl FriendStore for PgStore {
    async fn create_request(
        &self,
        sender: UserId,
        receiver: UserId,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<FriendRequest> {
        let edge = Friendship::new(sender, receiver);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let friends = tx
            .query_opt(
                "SELECT 1 FROM friendships WHERE user_a = $1 AND user_b = $2",
                &[&edge.user_a, &edge.user_b],
            )
            .await?;
        if friends.is_some() {
            return Err(AppError::AlreadyFriends);
        }

        let row = tx
            .query_opt(
                &format!(
                    "INSERT INTO friend_requests (id, sender_id, receiver_id, message, status, created_at)
                     VALUES ($1, $2, $3, $4, 'pending', $5)
                     ON CONFLICT DO NOTHING
                     RETURNING {REQUEST_COLUMNS}"
                ),
                &[&Uuid::new_v4(), &sender, &receiver, &message, &now],
            )
            .await?
            .ok_or(AppError::DuplicatePending)?;
        tx.commit().await?;
        request_from_row(&row)
    }

    async fn get_request(&self, id: Uuid) -> AppResult<Option<FriendRequest>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!("SELECT {REQUEST_COLUMNS} FROM friend_requests WHERE id = $1"),
                &[&id],
            )
            .await?
            .as_ref()
            .map(request_from_row)
            .transpose()
    }

    async fn resolve_request(
        &self,
        id: Uuid,
        responder: UserId,
        accept: bool,
    ) -> AppResult<FriendRequest> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                &format!("SELECT {REQUEST_COLUMNS} FROM friend_requests WHERE id = $1 FOR UPDATE"),
                &[&id],
            )
            .await?
            .ok_or(AppError::NotFound("friend request"))?;
        let mut request = request_from_row(&row)?;
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
        tx.execute(
            "UPDATE friend_requests SET status = $2 WHERE id = $1",
            &[&id, &request.status.to_db()],
        )
        .await?;
        if accept {
            let edge = Friendship::new(request.sender_id, request.receiver_id);
            tx.execute(
                "INSERT INTO friendships (user_a, user_b) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&edge.user_a, &edge.user_b],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(request)
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> AppResult<bool> {
        let edge = Friendship::new(a, b);
        let client = self.pool.get().await?;
        Ok(client
            .query_opt(
                "SELECT 1 FROM friendships WHERE user_a = $1 AND user_b = $2",
                &[&edge.user_a, &edge.user_b],
            )
            .await?
            .is_some())
    }

    async fn pending_between(&self, a: UserId, b: UserId) -> AppResult<Option<FriendRequest>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM friend_requests
                     WHERE status = 'pending'
                       AND ((sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1))"
                ),
                &[&a, &b],
            )
            .await?
            .as_ref()
            .map(request_from_row)
            .transpose()
    }

    async fn list_friend_ids(&self, user_id: UserId) -> AppResult<Vec<UserId>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT CASE WHEN user_a = $1 THEN user_b ELSE user_a END AS friend_id
                 FROM friendships WHERE user_a = $1 OR user_b = $1
                 ORDER BY friend_id",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn list_requests(&self, user_id: UserId) -> AppResult<Vec<FriendRequest>> {
        let client = self.pool.get().await?;
        client
            .query(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM friend_requests
                     WHERE sender_id = $1 OR receiver_id = $1
                     ORDER BY created_at DESC, id"
                ),
                &[&user_id],
            )
            .await?
            .iter()
            .map(request_from_row)
            .collect()
    }

    async fn delete_friendship(&self, a: UserId, b: UserId) -> AppResult<bool> {
        let edge = Friendship::new(a, b);
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM friendships WHERE user_a = $1 AND user_b = $2",
                &[&edge.user_a, &edge.user_b],
            )
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn get_user(&self, id: UserId) -> AppResult<Option<UserProfile>> {
        let client = self.pool.get().await?;
        Ok(client
            .query_opt(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"), &[&id])
            .await?
            .as_ref()
            .map(user_from_row))
    }

    async fn get_users(&self, ids: &[UserId]) -> AppResult<Vec<UserProfile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let ids = ids.to_vec();
        Ok(client
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1) ORDER BY id"),
                &[&ids],
            )
            .await?
            .iter()
            .map(user_from_row)
            .collect())
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<UserProfile>> {
        let client = self.pool.get().await?;
        Ok(client
            .query_opt(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"),
                &[&email.trim()],
            )
            .await?
            .as_ref()
            .map(user_from_row))
    }

    async fn search_users(&self, query: &str, limit: usize) -> AppResult<Vec<UserProfile>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let pattern = like_pattern(query.trim());
        Ok(client
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE name ILIKE $1 ESCAPE '\\' OR email ILIKE $1 ESCAPE '\\'
                     ORDER BY id LIMIT $2"
                ),
                &[&pattern, &to_i64(limit)],
            )
            .await?
            .iter()
            .map(user_from_row)
            .collect())
    }
}
