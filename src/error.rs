use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not a member of this conversation")]
    NotMember,

    #[error("permission denied")]
    PermissionDenied,

    #[error("revoke window expired (window: {window_secs}s)")]
    RevokeWindowExpired { window_secs: i64 },

    #[error("user is already a member")]
    AlreadyMember,

    #[error("users are already friends")]
    AlreadyFriends,

    #[error("a pending friend request already exists")]
    DuplicatePending,

    #[error("friend request already handled")]
    AlreadyHandled,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("admin must transfer the group or disband it before leaving")]
    AdminMustTransferOrDisband,

    #[error("cannot send a friend request to yourself")]
    SelfRequest,

    #[error("only the recipient can handle this friend request")]
    NotRequestRecipient,

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("internal server error")]
    Internal,
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: &'static str,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Unavailable(format!("database: {e}"))
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Unavailable(format!("database pool: {e}"))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Unavailable(format!("cache: {e}"))
    }
}

impl AppError {
    /// Store and cache failures may succeed on a later attempt; everything
    /// else is a domain decision that will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Unavailable(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) | AppError::SelfRequest => 400,
            AppError::Unauthorized => 401,
            AppError::NotMember
            | AppError::PermissionDenied
            | AppError::RevokeWindowExpired { .. }
            | AppError::NotRequestRecipient => 403,
            AppError::NotFound(_) => 404,
            AppError::AlreadyMember
            | AppError::AlreadyFriends
            | AppError::DuplicatePending
            | AppError::AlreadyHandled
            | AppError::AdminMustTransferOrDisband => 409,
            AppError::Unavailable(_) => 503,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => 500,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                "INTERNAL_SERVER_ERROR"
            }
            AppError::BadRequest(_) => "INVALID_REQUEST",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::NotMember => "NOT_MEMBER",
            AppError::PermissionDenied => "PERMISSION_DENIED",
            AppError::RevokeWindowExpired { .. } => "REVOKE_WINDOW_EXPIRED",
            AppError::AlreadyMember => "ALREADY_MEMBER",
            AppError::AlreadyFriends => "ALREADY_FRIENDS",
            AppError::DuplicatePending => "DUPLICATE_PENDING",
            AppError::AlreadyHandled => "ALREADY_HANDLED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AdminMustTransferOrDisband => "ADMIN_MUST_TRANSFER_OR_DISBAND",
            AppError::SelfRequest => "SELF_REQUEST",
            AppError::NotRequestRecipient => "NOT_REQUEST_RECIPIENT",
            AppError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            status: status.as_u16(),
            code: self.error_code(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if AppError::status_code(self) >= 500 {
            tracing::error!(error = %self, "request failed");
        }
        HttpResponse::build(ResponseError::status_code(self)).json(self.to_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        assert_eq!(AppError::NotMember.status_code(), 403);
        assert_eq!(AppError::NotFound("message").status_code(), 404);
        assert_eq!(AppError::DuplicatePending.status_code(), 409);
        assert_eq!(AppError::AdminMustTransferOrDisband.status_code(), 409);
        assert_eq!(
            AppError::RevokeWindowExpired { window_secs: 120 }.status_code(),
            403
        );
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(AppError::Unavailable("db down".into()).is_retryable());
        assert!(!AppError::AlreadyMember.is_retryable());
        assert!(!AppError::Internal.is_retryable());
    }

    #[test]
    fn response_body_carries_code_and_message() {
        let body = AppError::NotFound("conversation").to_response();
        assert_eq!(body.status, 404);
        assert_eq!(body.code, "NOT_FOUND");
        assert_eq!(body.error, "Not Found");
        assert_eq!(body.message, "conversation not found");
    }
}
