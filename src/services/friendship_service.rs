use crate::error::{AppError, AppResult};
use crate::models::{
    FriendRequest, FriendRequestStatus, FriendRequestView, FriendView, Page, Paged, UserId,
    UserProfile,
};
use crate::presence::PresenceStore;
use crate::store::{FriendStore, UserDirectory};
use mockable::Clock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Cap on fuzzy user search results.
pub const FUZZY_SEARCH_LIMIT: usize = 20;

#[derive(Clone)]
pub struct FriendshipService {
    friends: Arc<dyn FriendStore>,
    users: Arc<dyn UserDirectory>,
    presence: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
}

impl FriendshipService {
    pub fn new(
        friends: Arc<dyn FriendStore>,
        users: Arc<dyn UserDirectory>,
        presence: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            friends,
            users,
            presence,
            clock,
        }
    }

    pub async fn send_friend_request(
        &self,
        sender: UserId,
        receiver: UserId,
        message: &str,
    ) -> AppResult<FriendRequest> {
        if sender == receiver {
            return Err(AppError::SelfRequest);
        }
        if self.users.get_user(receiver).await?.is_none() {
            return Err(AppError::NotFound("user"));
        }
        if self.friends.are_friends(sender, receiver).await? {
            return Err(AppError::AlreadyFriends);
        }
        if self.friends.pending_between(sender, receiver).await?.is_some() {
            return Err(AppError::DuplicatePending);
        }

        let request = self
            .friends
            .create_request(sender, receiver, message.trim(), self.clock.utc())
            .await?;
        info!(request_id = %request.id, sender, receiver, "friend request sent");
        Ok(request)
    }

    pub async fn handle_friend_request(
        &self,
        request_id: Uuid,
        responder: UserId,
        accept: bool,
    ) -> AppResult<FriendRequest> {
        let request = self
            .friends
            .get_request(request_id)
            .await?
            .ok_or(AppError::NotFound("friend request"))?;
        if request.receiver_id != responder {
            return Err(AppError::NotRequestRecipient);
        }
        if request.status != FriendRequestStatus::Pending {
            return Err(AppError::AlreadyHandled);
        }

        let resolved = self
            .friends
            .resolve_request(request_id, responder, accept)
            .await?;
        info!(%request_id, responder, status = resolved.status.to_db(), "friend request handled");
        Ok(resolved)
    }

    /// Friend profiles with their online flag, optionally filtered by name
    /// or email.
    pub async fn get_friends(
        &self,
        user: UserId,
        query: Option<&str>,
    ) -> AppResult<Vec<FriendView>> {
        let ids = self.friends.list_friend_ids(user).await?;
        let query = query.unwrap_or_default();
        let profiles = self.users.get_users(&ids).await?;

        let mut friends = Vec::with_capacity(profiles.len());
        for profile in profiles.into_iter().filter(|p| p.matches(query)) {
            let is_online = super::is_online(&self.presence, profile.id).await;
            friends.push(FriendView { profile, is_online });
        }
        Ok(friends)
    }

    /// Requests the user sent or received, newest first, filtered on the
    /// other party's name or email.
    pub async fn get_friend_requests(
        &self,
        user: UserId,
        query: Option<&str>,
        page: Page,
    ) -> AppResult<Paged<FriendRequestView>> {
        let requests = self.friends.list_requests(user).await?;
        let ids: Vec<UserId> = requests
            .iter()
            .flat_map(|r| [r.sender_id, r.receiver_id])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let profiles: HashMap<UserId, UserProfile> = self
            .users
            .get_users(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let query = query.unwrap_or_default();
        let matching: Vec<FriendRequestView> = requests
            .into_iter()
            .filter(|r| {
                let counterpart = if r.sender_id == user {
                    r.receiver_id
                } else {
                    r.sender_id
                };
                profiles
                    .get(&counterpart)
                    .map(|p| p.matches(query))
                    .unwrap_or(query.trim().is_empty())
            })
            .map(|r| FriendRequestView {
                sender: profiles.get(&r.sender_id).cloned(),
                receiver: profiles.get(&r.receiver_id).cloned(),
                request: r,
            })
            .collect();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Paged { items, total })
    }

    pub async fn fuzzy_search_users(&self, query: &str) -> AppResult<Vec<UserProfile>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.users.search_users(query, FUZZY_SEARCH_LIMIT).await
    }

    pub async fn search_user_by_email(&self, email: &str) -> AppResult<UserProfile> {
        let email = email.trim();
        if email.is_empty() {
            return Err(AppError::BadRequest("email is required".into()));
        }
        self.users
            .find_by_email(email)
            .await?
            .ok_or(AppError::NotFound("user"))
    }

    /// Removes the friendship edge. Deleting a missing edge is not an error.
    pub async fn delete_friend(&self, user: UserId, friend: UserId) -> AppResult<bool> {
        let removed = self.friends.delete_friendship(user, friend).await?;
        if removed {
            info!(user, friend, "friendship removed");
        }
        Ok(removed)
    }
}
