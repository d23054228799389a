use crate::{
    error::AppError,
    middleware::guards::User,
    models::MessageKind,
    services::messaging::{HistoryQuery, SendMessage},
    state::AppState,
};
use actix_web::{get, post, put, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub client_msg_id: Option<String>,
}

/// Cursor names follow the existing web client (`before_id`, `after_id`).
#[derive(Deserialize)]
pub struct HistoryParams {
    pub query: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub before_id: Option<Uuid>,
    pub after_id: Option<Uuid>,
    pub after_seq: Option<i64>,
}

#[derive(Deserialize)]
pub struct ContextParams {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub message_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub advanced: bool,
}

/// GET /conversations/{id}/messages
#[get("/conversations/{id}/messages")]
pub async fn get_history(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    params: web::Query<HistoryParams>,
) -> Result<HttpResponse, AppError> {
    let params = params.into_inner();
    let messages = state
        .messaging
        .get_history(
            user.id,
            conversation_id.into_inner(),
            HistoryQuery {
                query: params.query,
                limit: params.limit,
                offset: params.offset,
                before_id: params.before_id,
                after_id: params.after_id,
                after_seq: params.after_seq,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /conversations/{id}/messages
#[post("/conversations/{id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let outcome = state
        .messaging
        .send_message(
            user.id,
            conversation_id.into_inner(),
            SendMessage {
                kind: body.kind,
                content: body.content,
                client_msg_id: body.client_msg_id,
            },
        )
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::Ok().json(outcome.value))
}

/// PUT /conversations/{id}/read
#[put("/conversations/{id}/read")]
pub async fn mark_as_read(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<MarkReadRequest>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .messaging
        .mark_as_read(user.id, conversation_id.into_inner(), body.message_id)
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::Ok().json(MarkReadResponse {
        advanced: outcome.value,
    }))
}

/// GET /messages/{id}/context
#[get("/messages/{id}/context")]
pub async fn get_message_context(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
    params: web::Query<ContextParams>,
) -> Result<HttpResponse, AppError> {
    let messages = state
        .messaging
        .get_message_context(user.id, message_id.into_inner(), params.limit)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// PUT /messages/{id}/revoke
#[put("/messages/{id}/revoke")]
pub async fn revoke_message(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .messaging
        .revoke_message(user.id, message_id.into_inner())
        .await?;
    state.registry.dispatch(outcome.notifications).await;
    Ok(HttpResponse::Ok().json(outcome.value))
}
