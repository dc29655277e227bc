//! Registration, login and token refresh.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use validator::Validate;

use super::{validation_error, ApiError};
use crate::auth::{AuthUser, RefreshUser};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 50, message = "must be 3 to 50 characters"))]
    pub username: String,
    #[validate(length(min = 6, max = 100, message = "must be 6 to 100 characters"))]
    pub password: String,
    pub registration_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate().map_err(validation_error)?;
    if req.registration_token != state.config.auth.registration_token {
        warn!(username = %req.username, "Registration with invalid token");
        return Err(ApiError::forbidden("Invalid registration token"));
    }

    let hashed = state.passwords.hash_password(&req.password)?;
    match state.database.users.create_user(&req.username, &hashed)? {
        Some(user) => {
            info!(user_id = user.id, username = %user.username, "User registered");
            Ok((StatusCode::CREATED, Json(json!({ "message": "User created successfully" }))))
        }
        None => Err(ApiError::bad_request("Username already registered")),
    }
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let invalid = || ApiError::unauthorized("Invalid username or password");
    let user = state
        .database
        .users
        .get_by_username(&req.username)?
        .ok_or_else(invalid)?;
    if !state.passwords.verify_password(&req.password, &user.hashed_password) {
        warn!(username = %req.username, "Failed login attempt");
        return Err(invalid());
    }

    let access_token = state
        .tokens
        .issue_access(user.id, &user.username)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let refresh_token = state
        .tokens
        .issue_refresh(user.id, &user.username)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!(user_id = user.id, "User logged in");

    Ok(Json(TokenResponse {
        access_token,
        refresh_token: Some(refresh_token),
        token_type: "bearer".to_string(),
    }))
}

/// POST /api/auth/refresh. The refresh token comes in the bearer header.
pub async fn refresh(
    State(state): State<AppState>,
    RefreshUser(user): RefreshUser,
) -> Result<Json<TokenResponse>, ApiError> {
    let access_token = state
        .tokens
        .issue_access(user.id, &user.username)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(TokenResponse {
        access_token,
        refresh_token: None,
        token_type: "bearer".to_string(),
    }))
}

/// GET /api/auth/me
pub async fn me(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(UserResponse {
        id: user.id,
        username: user.username,
        created_at: user.created_at,
    })
}
