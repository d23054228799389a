use super::PresenceStore;
use crate::error::AppResult;
use crate::models::UserId;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

/// Presence flags stored as `user:online:{id}` keys with `SET EX`.
#[derive(Clone)]
pub struct RedisPresence {
    redis: RedisClient,
}

impl RedisPresence {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

pub(crate) fn online_key(user_id: UserId) -> String {
    format!("user:online:{user_id}")
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn set_online(&self, user_id: UserId, ttl: Duration) -> AppResult<()> {
        let mut conn = self.redis.connection().await;
        let _: () = conn.set_ex(online_key(user_id), "1", ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn refresh(&self, user_id: UserId, ttl: Duration) -> AppResult<()> {
        // SET EX rather than EXPIRE so a flag lost to a race comes back
        self.set_online(user_id, ttl).await
    }

    async fn is_online(&self, user_id: UserId) -> AppResult<bool> {
        let mut conn = self.redis.connection().await;
        let exists: bool = conn.exists(online_key(user_id)).await?;
        Ok(exists)
    }

    async fn set_offline(&self, user_id: UserId) -> AppResult<()> {
        let mut conn = self.redis.connection().await;
        let _: () = conn.del(online_key(user_id)).await?;
        Ok(())
    }
}
