//! Service info, health, database statistics and Prometheus metrics.
use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use super::ApiError;
use crate::auth::AuthUser;
use crate::chat_db::DatabaseStats;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub database: DatabaseStats,
    pub active_streams: usize,
    pub total_requests: usize,
    pub chat_streams: usize,
    pub uploaded_files: usize,
    pub uptime_seconds: u64,
}

/// GET /
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Agent Chat API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /api/admin/stats
pub async fn db_stats(State(state): State<AppState>, _user: AuthUser) -> Result<Json<StatsResponse>, ApiError> {
    let database = state.database.get_stats()?;
    let counters = &state.counters;
    Ok(Json(StatsResponse {
        database,
        active_streams: state.active_streams.len(),
        total_requests: counters.total_requests.load(Ordering::Relaxed),
        chat_streams: counters.chat_streams.load(Ordering::Relaxed),
        uploaded_files: counters.uploaded_files.load(Ordering::Relaxed),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }))
}
