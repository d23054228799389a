use crate::{
    config::Config,
    presence::PresenceStore,
    services::{FriendshipService, GroupService, MessagingService},
    store::{ChatStore, FriendStore, UserDirectory},
    websocket::ConnectionRegistry,
};
use mockable::Clock;
use std::sync::Arc;

/// Store adapters the services are built on.
#[derive(Clone)]
pub struct Stores {
    pub chat: Arc<dyn ChatStore>,
    pub friends: Arc<dyn FriendStore>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    /// One adapter serving all three ports.
    pub fn from_single<S>(store: Arc<S>) -> Self
    where
        S: ChatStore + FriendStore + UserDirectory + 'static,
    {
        Self {
            chat: store.clone(),
            friends: store.clone(),
            users: store,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub messaging: MessagingService,
    pub groups: GroupService,
    pub friendships: FriendshipService,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        stores: Stores,
        presence: Arc<dyn PresenceStore>,
        registry: ConnectionRegistry,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        let messaging = MessagingService::new(
            stores.chat.clone(),
            stores.users.clone(),
            presence.clone(),
            clock.clone(),
            config.clone(),
        );
        let groups = GroupService::new(
            stores.chat.clone(),
            stores.users.clone(),
            presence.clone(),
            clock.clone(),
        );
        let friendships = FriendshipService::new(stores.friends, stores.users, presence, clock);
        Self {
            registry,
            messaging,
            groups,
            friendships,
            config,
        }
    }
}
