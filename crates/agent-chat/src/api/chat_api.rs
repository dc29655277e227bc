//! Streaming chat endpoint.
//!
//! Flow: client POST → ownership and model checks → per-session stream slot
//! → agent loop on a spawned task → events over SSE. The stream slot is held
//! by the task, so it is released when the loop finishes even if the client
//! went away.

use axum::{
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};
use validator::Validate;

use super::{validation_error, ApiError};
use crate::agent::{AgentRequest, INTERNAL_ERROR};
use crate::auth::AuthUser;
use crate::events::EventEmitter;
use crate::shared_state::AppState;

const EVENT_BUFFER: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize, Validate)]
pub struct ChatStreamRequest {
    pub session_id: i64,
    #[validate(length(min = 1, message = "must not be empty"))]
    pub message: String,
    pub model_id: Option<String>,
    #[serde(default)]
    pub files: Vec<i64>,
}

/// POST /api/chat/stream
pub async fn chat_stream(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ChatStreamRequest>,
) -> Result<Response, ApiError> {
    req.validate().map_err(validation_error)?;

    let session = state
        .database
        .sessions
        .get_session(user.id, req.session_id)?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    let model_id = req.model_id.clone().unwrap_or_else(|| session.model_id.clone());
    let model = state
        .config
        .find_model(&model_id)
        .cloned()
        .ok_or_else(|| ApiError::bad_request(format!("Unknown model: {}", model_id)))?;

    let guard = state
        .try_begin_stream(session.id)
        .ok_or_else(|| ApiError::conflict("A response is already being generated for this session"))?;

    if model.id != session.model_id {
        state
            .database
            .sessions
            .update_session(user.id, session.id, None, Some(&model.id))?;
    }

    let request_num = state.counters.inc_total_requests();
    info!(
        request_num,
        session_id = session.id,
        user_id = user.id,
        model = %model.id,
        files = req.files.len(),
        "Chat stream started"
    );

    let (mut emitter, rx) = EventEmitter::channel(EVENT_BUFFER);
    let agent = state.agent_loop();
    let request = AgentRequest {
        user_id: user.id,
        session_id: session.id,
        message: req.message,
        file_ids: req.files,
        model,
    };

    tokio::spawn(async move {
        let _guard = guard;
        let session_id = request.session_id;
        if let Err(e) = agent.run(request, &mut emitter).await {
            error!(session_id, "Agent loop failed: {:#}", e);
            emitter
                .finish_with_error(INTERNAL_ERROR, "An internal error occurred while generating the response")
                .await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(Event::default().data(event.to_sse_data())));
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive"));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}
