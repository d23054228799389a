//! HTTP and WebSocket surface, mounted under `/chat`.

use crate::models::Page;
use actix_web::web;
use serde::Deserialize;

pub mod conversations;
pub mod friends;
pub mod groups;
pub mod messages;
pub mod wsroute;

/// Listing parameters shared by paginated endpoints. `page` is 1-based and,
/// when given, takes precedence over `offset`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub page: Option<usize>,
}

impl ListQuery {
    pub fn page_with_default(&self, default_limit: usize) -> Page {
        let limit = Page::new(self.limit.unwrap_or(default_limit), 0).limit;
        let offset = match self.page {
            Some(page) => page.saturating_sub(1).saturating_mul(limit),
            None => self.offset.unwrap_or(0),
        };
        Page::new(limit, offset)
    }

    pub fn page(&self) -> Page {
        self.page_with_default(Page::default().limit)
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/chat")
            .service(wsroute::ws_handler)
            .service(conversations::list_conversations)
            .service(conversations::create_private_chat)
            .service(conversations::hide_conversation)
            .service(conversations::global_search)
            .service(groups::create_group)
            .service(groups::update_group_info)
            .service(groups::disband_group)
            .service(groups::leave_group)
            .service(groups::get_members)
            .service(groups::invite_member)
            .service(groups::kick_member)
            .service(groups::transfer_admin)
            .service(messages::get_history)
            .service(messages::send_message)
            .service(messages::mark_as_read)
            .service(messages::get_message_context)
            .service(messages::revoke_message)
            .service(friends::search_user_by_email)
            .service(friends::fuzzy_search_users)
            .service(friends::get_friends)
            .service(friends::delete_friend)
            .service(friends::get_friend_requests)
            .service(friends::send_friend_request)
            .service(friends::handle_friend_request),
    );
}
