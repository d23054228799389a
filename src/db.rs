use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

/// Tables owned by the messaging core. `users` is normally owned by the
/// platform's account service; it is created here only so a standalone
/// database works.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    avatar TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS conversations (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('private', 'group')),
    name TEXT NOT NULL DEFAULT '',
    avatar TEXT NOT NULL DEFAULT '',
    creator_id BIGINT NOT NULL,
    private_key TEXT UNIQUE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    user_id BIGINT NOT NULL,
    role TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('admin', 'member')),
    last_read_msg_time TIMESTAMPTZ,
    hidden_at TIMESTAMPTZ,
    joined_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (conversation_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_conversation_members_user ON conversation_members (user_id);
CREATE UNIQUE INDEX IF NOT EXISTS uniq_conversation_admin
    ON conversation_members (conversation_id) WHERE role = 'admin';

CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_id BIGINT,
    kind TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    client_msg_id TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    seq BIGSERIAL NOT NULL,
    is_revoked BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
    ON messages (conversation_id, created_at, seq);
CREATE UNIQUE INDEX IF NOT EXISTS uniq_messages_client_msg_id
    ON messages (conversation_id, client_msg_id) WHERE client_msg_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS friend_requests (
    id UUID PRIMARY KEY,
    sender_id BIGINT NOT NULL,
    receiver_id BIGINT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'accepted', 'rejected')),
    created_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS uniq_friend_requests_pending_pair
    ON friend_requests (LEAST(sender_id, receiver_id), GREATEST(sender_id, receiver_id))
    WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS friendships (
    user_a BIGINT NOT NULL,
    user_b BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (user_a, user_b),
    CHECK (user_a < user_b)
);
"#;

pub async fn init_pool(database_url: &str, max_connections: usize) -> Result<Pool, AppError> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    let client = tokio::time::timeout(Duration::from_secs(10), pool.get())
        .await
        .map_err(|_| AppError::StartServer("db connect timed out".into()))??;
    client.batch_execute(SCHEMA).await?;

    info!(max_connections, "database pool ready, schema verified");
    Ok(pool)
}
