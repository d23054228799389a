use super::ListQuery;
use crate::{error::AppError, middleware::guards::User, models::UserId, state::AppState};
use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFriendRequestBody {
    pub receiver_id: UserId,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendRequestAction {
    Accept,
    Reject,
}

#[derive(Deserialize)]
pub struct HandleFriendRequestBody {
    pub action: FriendRequestAction,
}

#[derive(Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

/// GET /users/search?email=
#[get("/users/search")]
pub async fn search_user_by_email(
    state: web::Data<AppState>,
    _user: User,
    query: web::Query<EmailQuery>,
) -> Result<HttpResponse, AppError> {
    let profile = state.friendships.search_user_by_email(&query.email).await?;
    Ok(HttpResponse::Ok().json(profile))
}

/// GET /users/search-fuzzy?query=
#[get("/users/search-fuzzy")]
pub async fn fuzzy_search_users(
    state: web::Data<AppState>,
    _user: User,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let users = state
        .friendships
        .fuzzy_search_users(query.query().unwrap_or_default())
        .await?;
    Ok(HttpResponse::Ok().json(users))
}

/// GET /friends
#[get("/friends")]
pub async fn get_friends(
    state: web::Data<AppState>,
    user: User,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let friends = state
        .friendships
        .get_friends(user.id, query.query())
        .await?;
    Ok(HttpResponse::Ok().json(friends))
}

/// DELETE /friends/{id}
#[delete("/friends/{id}")]
pub async fn delete_friend(
    state: web::Data<AppState>,
    user: User,
    friend_id: web::Path<UserId>,
) -> Result<HttpResponse, AppError> {
    state
        .friendships
        .delete_friend(user.id, friend_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /friend-requests
#[get("/friend-requests")]
pub async fn get_friend_requests(
    state: web::Data<AppState>,
    user: User,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let requests = state
        .friendships
        .get_friend_requests(user.id, query.query(), query.page_with_default(10))
        .await?;
    Ok(HttpResponse::Ok().json(requests))
}

/// POST /friend-requests
#[post("/friend-requests")]
pub async fn send_friend_request(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<SendFriendRequestBody>,
) -> Result<HttpResponse, AppError> {
    let request = state
        .friendships
        .send_friend_request(user.id, body.receiver_id, &body.message)
        .await?;
    Ok(HttpResponse::Created().json(request))
}

/// PUT /friend-requests/{id}
#[put("/friend-requests/{id}")]
pub async fn handle_friend_request(
    state: web::Data<AppState>,
    user: User,
    request_id: web::Path<Uuid>,
    body: web::Json<HandleFriendRequestBody>,
) -> Result<HttpResponse, AppError> {
    let accept = body.action == FriendRequestAction::Accept;
    let request = state
        .friendships
        .handle_friend_request(request_id.into_inner(), user.id, accept)
        .await?;
    Ok(HttpResponse::Ok().json(request))
}
