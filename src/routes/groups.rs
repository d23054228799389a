//! Group management endpoints
//!
//! Group-only checks and the admin requirement are enforced by
//! `GroupService`; handlers only translate HTTP and dispatch the resulting
//! events.

use super::ListQuery;
use crate::{
    error::AppError,
    middleware::guards::User,
    models::UserId,
    services::group_service::{CreateGroup, UpdateGroupInfo},
    state::AppState,
};
use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

// ============================================
// Request DTOs
// ============================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Deserialize)]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteMemberRequest {
    pub user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAdminRequest {
    pub new_admin_id: UserId,
}

// ============================================
// Endpoints
// ============================================

/// POST /groups
#[post("/groups")]
pub async fn create_group(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let outcome = state
        .groups
        .create_group(
            user.id,
            CreateGroup {
                name: body.name,
                member_ids: body.member_ids,
            },
        )
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::Created().json(outcome.value))
}

/// PUT /conversations/{id}
/// Rename the group or change its avatar
///
/// Authorization: Requires admin role
#[put("/conversations/{id}")]
pub async fn update_group_info(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<UpdateGroupRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let outcome = state
        .groups
        .update_group_info(
            user.id,
            conversation_id.into_inner(),
            UpdateGroupInfo {
                name: body.name,
                avatar: body.avatar,
            },
        )
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::Ok().json(outcome.value))
}

/// DELETE /conversations/{id}
/// Disband the group, deleting its members and messages
///
/// Authorization: Requires admin role
#[delete("/conversations/{id}")]
pub async fn disband_group(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .groups
        .disband_group(user.id, conversation_id.into_inner())
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /conversations/{id}/leave
#[post("/conversations/{id}/leave")]
pub async fn leave_group(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .groups
        .leave_group(user.id, conversation_id.into_inner())
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /conversations/{id}/members
#[get("/conversations/{id}/members")]
pub async fn get_members(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let members = state
        .groups
        .get_members(
            user.id,
            conversation_id.into_inner(),
            query.query(),
            query.page(),
        )
        .await?;
    Ok(HttpResponse::Ok().json(members))
}

/// POST /conversations/{id}/members
///
/// Authorization: Requires admin role
#[post("/conversations/{id}/members")]
pub async fn invite_member(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<InviteMemberRequest>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .groups
        .invite_member(user.id, conversation_id.into_inner(), body.user_id)
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::NoContent().finish())
}

/// DELETE /conversations/{id}/members/{user_id}
///
/// Authorization: Requires admin role
#[delete("/conversations/{id}/members/{user_id}")]
pub async fn kick_member(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<(Uuid, UserId)>,
) -> Result<HttpResponse, AppError> {
    let (conversation_id, target) = path.into_inner();
    let outcome = state
        .groups
        .kick_member(user.id, conversation_id, target)
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /conversations/{id}/transfer
///
/// Authorization: Requires admin role
#[post("/conversations/{id}/transfer")]
pub async fn transfer_admin(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<TransferAdminRequest>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .groups
        .transfer_admin(user.id, conversation_id.into_inner(), body.new_admin_id)
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::NoContent().finish())
}
