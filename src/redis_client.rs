use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

#[derive(Clone)]
pub struct RedisClient {
    manager: SharedConnectionManager,
}

impl RedisClient {
    pub fn new(manager: SharedConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    /// Cheap clone of the managed connection; the manager reconnects on its
    /// own after a dropped link.
    pub async fn connection(&self) -> ConnectionManager {
        self.manager.lock().await.clone()
    }
}
