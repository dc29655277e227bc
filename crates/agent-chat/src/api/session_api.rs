//! Chat session CRUD. Every route is scoped to the authenticated user.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use validator::Validate;

use super::{validation_error, ApiError};
use crate::agent::history::AssistantFinal;
use crate::auth::AuthUser;
use crate::chat_db::{MessageRole, Session, StoredMessage};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(max = 200, message = "must be at most 200 characters"))]
    pub title: Option<String>,
    pub model_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSessionRequest {
    #[validate(length(max = 200, message = "must be at most 200 characters"))]
    pub title: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: i64,
    pub title: Option<String>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            title: session.title,
            model_id: session.model_id,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub role: MessageRole,
    /// User content parts, or the final answer text for assistant messages.
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    pub sequence: i64,
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for MessageResponse {
    fn from(message: StoredMessage) -> Self {
        let parse = |raw: Option<String>| {
            raw.map(|text| serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
        };

        let (content, progress) = match message.role {
            MessageRole::Assistant if message.tool_call_id.is_none() => {
                match message.content.as_deref().and_then(AssistantFinal::parse) {
                    Some(envelope) => (Some(Value::String(envelope.final_text)), envelope.progress),
                    None => (message.content.clone().map(Value::String), Vec::new()),
                }
            }
            MessageRole::Assistant => (message.content.clone().map(Value::String), Vec::new()),
            _ => (parse(message.content.clone()), Vec::new()),
        };

        Self {
            id: message.id,
            role: message.role,
            content,
            progress,
            tool_call_id: message.tool_call_id,
            tool_name: message.tool_name,
            tool_input: parse(message.tool_input),
            tool_output: parse(message.tool_output),
            sequence: message.sequence,
            model_id: message.model_id,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub session: SessionResponse,
    pub messages: Vec<MessageResponse>,
}

fn ensure_model(state: &AppState, model_id: &str) -> Result<(), ApiError> {
    state
        .config
        .find_model(model_id)
        .map(|_| ())
        .ok_or_else(|| ApiError::bad_request(format!("Unknown model: {}", model_id)))
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    req.validate().map_err(validation_error)?;
    ensure_model(&state, &req.model_id)?;
    let session = state
        .database
        .sessions
        .create_session(user.id, req.title.as_deref(), &req.model_id)?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let sessions = state.database.sessions.list_sessions(user.id)?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

/// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<i64>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session = state
        .database
        .sessions
        .get_session(user.id, session_id)?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    let messages = state.database.messages.list_messages(session.id)?;
    Ok(Json(SessionDetailResponse {
        session: session.into(),
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

/// PATCH /api/sessions/:id
pub async fn update_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<i64>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    req.validate().map_err(validation_error)?;
    if let Some(model_id) = req.model_id.as_deref() {
        ensure_model(&state, model_id)?;
    }
    let session = state
        .database
        .sessions
        .update_session(user.id, session_id, req.title.as_deref(), req.model_id.as_deref())?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(session.into()))
}

/// DELETE /api/sessions/:id
pub async fn delete_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.database.sessions.delete_session(user.id, session_id)? {
        return Err(ApiError::not_found("Session not found"));
    }
    info!(session_id, user_id = user.id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
}
