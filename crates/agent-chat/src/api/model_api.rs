//! The model catalogue offered to the frontend.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::config::ModelInfo;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

/// GET /api/models
pub async fn list_models(State(state): State<AppState>, _user: AuthUser) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.config.models.clone(),
    })
}
