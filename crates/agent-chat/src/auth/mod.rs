// agent-chat/crates/agent-chat/src/auth/mod.rs
//! Password hashing, JWT issuance and the request extractors built on them.

pub mod jwt;
pub mod password;

pub use jwt::{Claims, TokenError, TokenService, TokenType};
pub use password::PasswordHasher;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use tracing::debug;

use crate::api::ApiError;
use crate::chat_db::User;
use crate::shared_state::AppState;

/// The user behind a valid access token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

/// The user behind a valid refresh token.
#[derive(Debug, Clone)]
pub struct RefreshUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(parts, state, TokenType::Access).map(AuthUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for RefreshUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(parts, state, TokenType::Refresh).map(RefreshUser)
    }
}

pub(crate) fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn authenticate(parts: &Parts, state: &AppState, expected: TokenType) -> Result<User, ApiError> {
    let token = bearer_token(parts).ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    let claims = state.tokens.verify(token, expected).map_err(|e| {
        debug!(error = %e, "Rejected token");
        match e {
            TokenError::WrongType => ApiError::unauthorized("Incorrect token type"),
            TokenError::Expired => ApiError::unauthorized("Token has expired"),
            TokenError::Invalid | TokenError::Signing => {
                ApiError::unauthorized("Could not validate credentials")
            }
        }
    })?;

    let user_id = claims
        .user_id()
        .map_err(|_| ApiError::unauthorized("Could not validate credentials"))?;

    state
        .database
        .users
        .get_by_id(user_id)?
        .ok_or_else(|| ApiError::unauthorized("User not found"))
}
