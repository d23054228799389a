//! "Is this user online" flags with a time-to-live.
//!
//! The hub owns the decision of when a user comes online or goes offline;
//! this port only stores the flag. Entries expire on their own if a server
//! dies without cleaning up, which is why every write carries a TTL.

use crate::error::AppResult;
use crate::models::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub mod redis;

pub use self::redis::RedisPresence;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, user_id: UserId, ttl: Duration) -> AppResult<()>;

    /// Extends the TTL, recreating the flag if it already expired.
    async fn refresh(&self, user_id: UserId, ttl: Duration) -> AppResult<()>;

    async fn is_online(&self, user_id: UserId) -> AppResult<bool>;

    async fn set_offline(&self, user_id: UserId) -> AppResult<()>;
}

/// Process-local presence for single-instance runs and tests.
#[derive(Default)]
pub struct InMemoryPresence {
    expiry: Mutex<HashMap<UserId, Instant>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresence {
    async fn set_online(&self, user_id: UserId, ttl: Duration) -> AppResult<()> {
        self.expiry.lock().await.insert(user_id, Instant::now() + ttl);
        Ok(())
    }

    async fn refresh(&self, user_id: UserId, ttl: Duration) -> AppResult<()> {
        self.set_online(user_id, ttl).await
    }

    async fn is_online(&self, user_id: UserId) -> AppResult<bool> {
        let mut expiry = self.expiry.lock().await;
        match expiry.get(&user_id) {
            Some(deadline) if *deadline > Instant::now() => Ok(true),
            Some(_) => {
                expiry.remove(&user_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn set_offline(&self, user_id: UserId) -> AppResult<()> {
        self.expiry.lock().await.remove(&user_id);
        Ok(())
    }
}
