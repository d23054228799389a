//! Caller identity extraction.
//!
//! Authentication happens upstream: the gateway either inserts an
//! [`AuthenticatedUser`] request extension or forwards the verified id in the
//! `x-user-id` header. Handlers take a [`User`] argument and never see an
//! unauthenticated request.

use crate::error::AppError;
use crate::models::UserId;
use actix_web::{dev::Payload, Error, FromRequest, HttpMessage, HttpRequest};
use std::future::{ready, Ready};

pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity placed in request extensions by an authenticating middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

/// The calling user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
}

fn user_from_request(req: &HttpRequest) -> Result<User, AppError> {
    if let Some(user) = req.extensions().get::<AuthenticatedUser>() {
        return Ok(User { id: user.0 });
    }
    let id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<UserId>().ok())
        .filter(|id| *id > 0)
        .ok_or(AppError::Unauthorized)?;
    Ok(User { id })
}

impl FromRequest for User {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(user_from_request(req).map_err(Error::from))
    }
}
