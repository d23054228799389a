use super::ListQuery;
use crate::{error::AppError, middleware::guards::User, models::UserId, state::AppState};
use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrivateChatRequest {
    pub target_user_id: UserId,
}

/// GET /conversations
#[get("/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    user: User,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let page = state
        .messaging
        .list_conversations(user.id, query.query(), query.page())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

/// POST /privates
/// Returns the private chat with the target, creating it on first use
#[post("/privates")]
pub async fn create_private_chat(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreatePrivateChatRequest>,
) -> Result<HttpResponse, AppError> {
    let view = state
        .messaging
        .get_or_create_private_chat(user.id, body.target_user_id)
        .await?;
    Ok(HttpResponse::Ok().json(view))
}

/// POST /conversations/{id}/hide
#[post("/conversations/{id}/hide")]
pub async fn hide_conversation(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    state
        .messaging
        .hide_conversation(user.id, conversation_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /search
/// Substring search across every conversation the caller belongs to
#[get("/search")]
pub async fn global_search(
    state: web::Data<AppState>,
    user: User,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let hits = state
        .messaging
        .global_search(user.id, query.query().unwrap_or_default(), query.page())
        .await?;
    Ok(HttpResponse::Ok().json(hits))
}
