//! Group lifecycle: create, invite, kick, leave, transfer, disband, rename.
//!
//! Every operation first checks that the conversation is a group and that
//! the actor belongs to it, then lets the store re-check the admin role
//! inside the write.

use super::{conversation_view, display_name, is_online, Outcome};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationMember, ConversationView, MemberView, NewMessage, Page, Paged,
    UserId,
};
use crate::presence::PresenceStore;
use crate::store::{contains_ci, ChatStore, GroupInfoChange, NewGroup, UserDirectory};
use crate::websocket::{ChatEvent, LeaveReason, Notification};
use mockable::Clock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CreateGroup {
    pub name: String,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateGroupInfo {
    pub name: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Clone)]
pub struct GroupService {
    store: Arc<dyn ChatStore>,
    users: Arc<dyn UserDirectory>,
    presence: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
}

impl GroupService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        users: Arc<dyn UserDirectory>,
        presence: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            users,
            presence,
            clock,
        }
    }

    async fn name_of(&self, user_id: UserId) -> AppResult<String> {
        let profile = self.users.get_user(user_id).await?;
        Ok(display_name(profile.as_ref(), user_id))
    }

    /// Group conversation plus the actor's membership.
    async fn group_member(
        &self,
        conversation_id: Uuid,
        actor: UserId,
    ) -> AppResult<(Conversation, ConversationMember)> {
        let conv = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        if !conv.is_group() {
            return Err(AppError::BadRequest(
                "operation is only valid for group chats".into(),
            ));
        }
        let member = self
            .store
            .get_member(conversation_id, actor)
            .await?
            .ok_or(AppError::NotMember)?;
        Ok((conv, member))
    }

    async fn group_admin(
        &self,
        conversation_id: Uuid,
        actor: UserId,
    ) -> AppResult<(Conversation, ConversationMember)> {
        let (conv, member) = self.group_member(conversation_id, actor).await?;
        if !member.is_admin() {
            return Err(AppError::PermissionDenied);
        }
        Ok((conv, member))
    }

    async fn member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<UserId>> {
        Ok(self
            .store
            .list_members(conversation_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect())
    }

    pub async fn create_group(
        &self,
        creator: UserId,
        req: CreateGroup,
    ) -> AppResult<Outcome<ConversationView>> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::BadRequest("group name is required".into()));
        }
        let member_ids: Vec<UserId> = req
            .member_ids
            .into_iter()
            .filter(|id| *id != creator)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if self.users.get_users(&member_ids).await?.len() != member_ids.len() {
            return Err(AppError::NotFound("user"));
        }

        let now = self.clock.utc();
        let id = Uuid::new_v4();
        let creator_name = self.name_of(creator).await?;
        let system = NewMessage::system(id, format!("{creator_name} created the group"), now);
        let (conv, message) = self
            .store
            .create_group(
                NewGroup {
                    id,
                    name,
                    creator_id: creator,
                    member_ids,
                    created_at: now,
                },
                system,
            )
            .await?;

        info!(conversation_id = %conv.id, creator, "group created");
        let view = conversation_view(&self.store, &self.users, &self.presence, &conv, creator).await?;
        let notification =
            Notification::to_users(view.member_ids.clone(), ChatEvent::new_message(message));
        Ok(Outcome::with(view, vec![notification]))
    }

    pub async fn invite_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        user_id: UserId,
    ) -> AppResult<Outcome<()>> {
        self.group_admin(conversation_id, actor).await?;
        let target = self
            .users
            .get_user(user_id)
            .await?
            .ok_or(AppError::NotFound("user"))?;
        if self.store.get_member(conversation_id, user_id).await?.is_some() {
            return Err(AppError::AlreadyMember);
        }

        let content = format!("{} joined the group", display_name(Some(&target), user_id));
        let message = self
            .store
            .add_member(
                actor,
                conversation_id,
                user_id,
                NewMessage::system(conversation_id, content, self.clock.utc()),
            )
            .await?;

        info!(%conversation_id, actor, user_id, "member invited");
        let members = self.member_ids(conversation_id).await?;
        Ok(Outcome::with(
            (),
            vec![Notification::to_users(members, ChatEvent::new_message(message))],
        ))
    }

    pub async fn kick_member(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        target: UserId,
    ) -> AppResult<Outcome<()>> {
        self.group_admin(conversation_id, actor).await?;
        if target == actor {
            return Err(AppError::BadRequest("cannot remove yourself".into()));
        }
        if self.store.get_member(conversation_id, target).await?.is_none() {
            return Err(AppError::NotMember);
        }

        let content = format!("{} was removed from the group", self.name_of(target).await?);
        let removal = self
            .store
            .remove_member(
                actor,
                conversation_id,
                target,
                NewMessage::system(conversation_id, content, self.clock.utc()),
            )
            .await?;

        info!(%conversation_id, actor, target, "member kicked");
        let left = ChatEvent::MemberLeft {
            conversation_id,
            user_id: target,
            reason: LeaveReason::Kicked,
        };
        Ok(Outcome::with(
            (),
            vec![
                Notification::to_users(removal.members_before.clone(), left),
                Notification::to_users_except(
                    &removal.members_before,
                    target,
                    ChatEvent::new_message(removal.system_message),
                ),
            ],
        ))
    }

    pub async fn leave_group(&self, user: UserId, conversation_id: Uuid) -> AppResult<Outcome<()>> {
        let (_, member) = self.group_member(conversation_id, user).await?;
        if member.is_admin() {
            return Err(AppError::AdminMustTransferOrDisband);
        }

        let content = format!("{} left the group", self.name_of(user).await?);
        let removal = self
            .store
            .leave(
                conversation_id,
                user,
                NewMessage::system(conversation_id, content, self.clock.utc()),
            )
            .await?;

        info!(%conversation_id, user, "member left");
        let left = ChatEvent::MemberLeft {
            conversation_id,
            user_id: user,
            reason: LeaveReason::Left,
        };
        Ok(Outcome::with(
            (),
            vec![
                Notification::to_users(removal.members_before.clone(), left),
                Notification::to_users_except(
                    &removal.members_before,
                    user,
                    ChatEvent::new_message(removal.system_message),
                ),
            ],
        ))
    }

    pub async fn transfer_admin(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        new_admin: UserId,
    ) -> AppResult<Outcome<()>> {
        self.group_admin(conversation_id, actor).await?;
        if new_admin == actor {
            return Err(AppError::BadRequest("cannot transfer to yourself".into()));
        }
        if self.store.get_member(conversation_id, new_admin).await?.is_none() {
            return Err(AppError::NotMember);
        }

        let members = self
            .store
            .transfer_admin(actor, conversation_id, new_admin)
            .await?;

        info!(%conversation_id, old_admin = actor, new_admin, "admin transferred");
        let event = ChatEvent::AdminTransferred {
            conversation_id,
            old_admin_id: actor,
            new_admin_id: new_admin,
        };
        Ok(Outcome::with((), vec![Notification::to_users(members, event)]))
    }

    pub async fn disband_group(&self, actor: UserId, conversation_id: Uuid) -> AppResult<Outcome<()>> {
        self.group_admin(conversation_id, actor).await?;
        let members = self.store.disband(actor, conversation_id).await?;

        info!(%conversation_id, actor, members = members.len(), "group disbanded");
        Ok(Outcome::with(
            (),
            vec![Notification::to_users(
                members,
                ChatEvent::GroupDisbanded { conversation_id },
            )],
        ))
    }

    /// Renames the group or changes its avatar. Blank or unchanged fields are
    /// ignored; when nothing changes no event is produced.
    pub async fn update_group_info(
        &self,
        actor: UserId,
        conversation_id: Uuid,
        req: UpdateGroupInfo,
    ) -> AppResult<Outcome<ConversationView>> {
        let (conv, _) = self.group_admin(conversation_id, actor).await?;

        let name = req
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty() && *n != conv.name);
        let avatar = req
            .avatar
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty() && *a != conv.avatar);

        if name.is_none() && avatar.is_none() {
            let view =
                conversation_view(&self.store, &self.users, &self.presence, &conv, actor).await?;
            return Ok(Outcome::new(view));
        }

        let system_message = match &name {
            Some(new_name) => Some(NewMessage::system(
                conversation_id,
                format!(
                    "{} renamed the group to \"{new_name}\"",
                    self.name_of(actor).await?
                ),
                self.clock.utc(),
            )),
            None => None,
        };
        let (updated, message) = self
            .store
            .update_group_info(
                actor,
                conversation_id,
                GroupInfoChange {
                    name,
                    avatar,
                    system_message,
                },
            )
            .await?;

        info!(%conversation_id, actor, "group info updated");
        let view =
            conversation_view(&self.store, &self.users, &self.presence, &updated, actor).await?;
        let mut notifications = vec![Notification::to_users(
            view.member_ids.clone(),
            ChatEvent::GroupInfoUpdated {
                conversation_id,
                name: updated.name.clone(),
                avatar: updated.avatar.clone(),
            },
        )];
        if let Some(message) = message {
            notifications.push(Notification::to_users(
                view.member_ids.clone(),
                ChatEvent::new_message(message),
            ));
        }
        Ok(Outcome::with(view, notifications))
    }

    /// Members with profiles and presence, filtered by name.
    pub async fn get_members(
        &self,
        user: UserId,
        conversation_id: Uuid,
        query: Option<&str>,
        page: Page,
    ) -> AppResult<Paged<MemberView>> {
        self.group_member(conversation_id, user).await?;
        let members = self.store.list_members(conversation_id).await?;
        let ids: Vec<UserId> = members.iter().map(|m| m.user_id).collect();
        let profiles: HashMap<UserId, _> = self
            .users
            .get_users(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let matching: Vec<(ConversationMember, String, String)> = members
            .into_iter()
            .map(|m| {
                let profile = profiles.get(&m.user_id);
                let name = display_name(profile, m.user_id);
                let avatar = profile.map(|p| p.avatar.clone()).unwrap_or_default();
                (m, name, avatar)
            })
            .filter(|(_, name, _)| query.map(|q| contains_ci(name, q)).unwrap_or(true))
            .collect();

        let total = matching.len();
        let mut items = Vec::new();
        for (member, name, avatar) in matching.into_iter().skip(page.offset).take(page.limit) {
            items.push(MemberView {
                user_id: member.user_id,
                name,
                avatar,
                role: member.role,
                joined_at: member.joined_at,
                is_online: is_online(&self.presence, member.user_id).await,
            });
        }
        Ok(Paged { items, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberRole, UserProfile};
    use crate::presence::InMemoryPresence;
    use crate::store::InMemoryStore;
    use mockable::DefaultClock;

    fn profile(id: UserId, name: &str) -> UserProfile {
        UserProfile {
            id,
            name: name.into(),
            email: format!("{}@school.edu", name.to_lowercase()),
            avatar: String::new(),
        }
    }

    fn service() -> GroupService {
        let store = Arc::new(InMemoryStore::with_users([
            profile(1, "Ada"),
            profile(2, "Ben"),
            profile(3, "Cy"),
            profile(4, "Dee"),
        ]));
        GroupService::new(
            store.clone(),
            store,
            Arc::new(InMemoryPresence::new()),
            Arc::new(DefaultClock),
        )
    }

    async fn group(svc: &GroupService) -> Uuid {
        svc.create_group(
            1,
            CreateGroup {
                name: "Algebra".into(),
                member_ids: vec![2, 3, 1, 2],
            },
        )
        .await
        .unwrap()
        .value
        .id
    }

    #[tokio::test]
    async fn create_dedups_members_and_makes_creator_admin() {
        let svc = service();
        let id = group(&svc).await;

        let members = svc.get_members(1, id, None, Page::default()).await.unwrap();
        assert_eq!(members.total, 3);
        let admins: Vec<_> = members
            .items
            .iter()
            .filter(|m| m.role == MemberRole::Admin)
            .map(|m| m.user_id)
            .collect();
        assert_eq!(admins, vec![1]);
    }

    #[tokio::test]
    async fn create_requires_a_name() {
        let svc = service();
        let err = svc
            .create_group(1, CreateGroup { name: " ".into(), member_ids: vec![2] })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn non_admin_cannot_invite() {
        let svc = service();
        let id = group(&svc).await;
        assert_eq!(
            svc.invite_member(2, id, 4).await.unwrap_err(),
            AppError::PermissionDenied
        );
        assert_eq!(
            svc.invite_member(4, id, 4).await.unwrap_err(),
            AppError::NotMember
        );
    }

    #[tokio::test]
    async fn inviting_existing_member_conflicts() {
        let svc = service();
        let id = group(&svc).await;
        assert_eq!(
            svc.invite_member(1, id, 3).await.unwrap_err(),
            AppError::AlreadyMember
        );
    }

    #[tokio::test]
    async fn kick_notifies_the_kicked_member_too() {
        let svc = service();
        let id = group(&svc).await;

        let outcome = svc.kick_member(1, id, 3).await.unwrap();
        let left = &outcome.notifications[0];
        assert_eq!(left.recipient_ids(), &[1, 2, 3]);
        assert!(matches!(
            left.event,
            ChatEvent::MemberLeft { user_id: 3, reason: LeaveReason::Kicked, .. }
        ));
        assert_eq!(outcome.notifications[1].recipient_ids(), &[1, 2]);
    }

    #[tokio::test]
    async fn kick_rules() {
        let svc = service();
        let id = group(&svc).await;
        assert!(matches!(
            svc.kick_member(1, id, 1).await.unwrap_err(),
            AppError::BadRequest(_)
        ));
        assert_eq!(svc.kick_member(1, id, 4).await.unwrap_err(), AppError::NotMember);
        assert_eq!(
            svc.kick_member(2, id, 3).await.unwrap_err(),
            AppError::PermissionDenied
        );
    }

    #[tokio::test]
    async fn admin_cannot_leave() {
        let svc = service();
        let id = group(&svc).await;
        assert_eq!(
            svc.leave_group(1, id).await.unwrap_err(),
            AppError::AdminMustTransferOrDisband
        );
    }

    #[tokio::test]
    async fn transfer_to_self_or_outsider_fails() {
        let svc = service();
        let id = group(&svc).await;
        assert!(matches!(
            svc.transfer_admin(1, id, 1).await.unwrap_err(),
            AppError::BadRequest(_)
        ));
        assert_eq!(
            svc.transfer_admin(1, id, 4).await.unwrap_err(),
            AppError::NotMember
        );
    }

    #[tokio::test]
    async fn disband_notifies_everyone_captured_before() {
        let svc = service();
        let id = group(&svc).await;

        let outcome = svc.disband_group(1, id).await.unwrap();
        assert_eq!(outcome.notifications[0].recipient_ids(), &[1, 2, 3]);
        assert_eq!(
            svc.get_members(1, id, None, Page::default()).await.unwrap_err(),
            AppError::NotFound("conversation")
        );
    }

    #[tokio::test]
    async fn unchanged_info_is_a_no_op() {
        let svc = service();
        let id = group(&svc).await;

        let outcome = svc
            .update_group_info(
                1,
                id,
                UpdateGroupInfo {
                    name: Some("Algebra".into()),
                    avatar: Some("".into()),
                },
            )
            .await
            .unwrap();
        assert!(outcome.notifications.is_empty());
    }

    #[tokio::test]
    async fn rename_emits_info_update_and_system_message() {
        let svc = service();
        let id = group(&svc).await;

        let outcome = svc
            .update_group_info(
                1,
                id,
                UpdateGroupInfo {
                    name: Some("Geometry".into()),
                    avatar: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.value.name, "Geometry");
        assert_eq!(outcome.notifications.len(), 2);
        match &outcome.notifications[1].event {
            ChatEvent::NewMessage(m) => assert_eq!(m.content, "Ada renamed the group to \"Geometry\""),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn members_filter_by_name() {
        let svc = service();
        let id = group(&svc).await;
        let page = svc.get_members(2, id, Some("be"), Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].name, "Ben");
    }
}
