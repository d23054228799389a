//! Shared fixtures for integration tests: an in-memory application state
//! with a clock the test can move forward.
#![allow(dead_code)]

use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use edu_chat_service::{
    config::{Config, PresenceConfig},
    models::{UserId, UserProfile},
    presence::InMemoryPresence,
    services::RelatedUsers,
    state::{AppState, Stores},
    store::InMemoryStore,
    websocket::ConnectionRegistry,
};
use mockable::Clock;
use std::sync::{Arc, Mutex};

pub const ADA: UserId = 1;
pub const BEN: UserId = 2;
pub const CY: UserId = 3;
pub const DEE: UserId = 4;

pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance_seconds(&self, seconds: i64) {
        *self.lock_clock() += TimeDelta::seconds(seconds);
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("clock mutex"),
        }
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

pub fn profile(id: UserId, name: &str) -> UserProfile {
    UserProfile {
        id,
        name: name.into(),
        email: format!("{}@school.edu", name.to_lowercase()),
        avatar: String::new(),
    }
}

pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<MutableClock>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::with_users([
            profile(ADA, "Ada"),
            profile(BEN, "Ben"),
            profile(CY, "Cy"),
            profile(DEE, "Dee"),
        ]));
        let presence = Arc::new(InMemoryPresence::new());
        let clock = Arc::new(MutableClock::new(
            Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0)
                .single()
                .unwrap_or_else(|| panic!("valid start time")),
        ));
        let stores = Stores::from_single(store);
        let registry = ConnectionRegistry::new(presence.clone(), PresenceConfig::default(), 16)
            .with_status_audience(Arc::new(RelatedUsers::new(
                stores.chat.clone(),
                stores.friends.clone(),
            )));
        let state = AppState::new(
            stores,
            presence,
            registry,
            clock.clone(),
            Arc::new(config),
        );
        Self { state, clock }
    }
}
