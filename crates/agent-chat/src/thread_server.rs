//! Server startup and routing.
//!
//! Every handler reaches its collaborators through the Arc-wrapped
//! [`SharedSystemState`]; the only outbound network calls are to the model
//! backend and the search service.

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request},
    http::Method,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    api::{admin_api, auth_api, chat_api, file_api, model_api, session_api},
    chat_db::ChatDatabase,
    config::Config,
    metrics,
    shared_state::{AppState, SharedSystemState},
};

/// Extra room above the document limit for multipart framing and
/// client-rendered PDF pages.
const BODY_HEADROOM: usize = 32 * 1024 * 1024;

/// Run the HTTP server until Ctrl-C or SIGTERM.
pub async fn run_thread_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    metrics::init_metrics();
    cfg.print_config();

    let database = Arc::new(ChatDatabase::new(&cfg.database_path)?);
    info!("Chat database initialized at: {}", cfg.database_path.display());

    let addr = cfg.api_addr()?;
    let shared_state = Arc::new(SharedSystemState::new(cfg, database)?);
    let app = build_router(AppState::new(shared_state.clone()));

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; draining conversion workers");
    shared_state.conversion.shutdown();
    Ok(())
}

/// All routes with CORS, tracing and body limits applied.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.conversion.max_file_size.saturating_add(BODY_HEADROOM);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(admin_api::root))
        .route("/health", get(admin_api::health))
        .route("/metrics", get(metrics::get_metrics))
        .route("/api/admin/stats", get(admin_api::db_stats))
        // Auth
        .route("/api/auth/register", post(auth_api::register))
        .route("/api/auth/login", post(auth_api::login))
        .route("/api/auth/refresh", post(auth_api::refresh))
        .route("/api/auth/me", get(auth_api::me))
        // Sessions and models
        .route(
            "/api/sessions",
            get(session_api::list_sessions).post(session_api::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(session_api::get_session)
                .patch(session_api::update_session)
                .delete(session_api::delete_session),
        )
        .route("/api/models", get(model_api::list_models))
        // Chat
        .route("/api/chat/stream", post(chat_api::chat_stream))
        // Files
        .route("/api/files/upload", post(file_api::upload_file))
        .route("/api/files", get(file_api::list_files))
        .route(
            "/api/files/:id",
            get(file_api::download_file).delete(file_api::delete_file),
        )
        .route("/api/files/:id/status", get(file_api::file_status))
        .route("/api/files/:id/images", get(file_api::file_images))
        .route("/api/files/:id/images/:page", get(file_api::file_image_page))
        .layer(middleware::from_fn(track_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Counts responses per matched route and status class.
async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let response = next.run(request).await;
    let status = response.status();
    let class = if status.is_server_error() {
        "5xx"
    } else if status.is_client_error() {
        "4xx"
    } else {
        "ok"
    };
    metrics::inc_request(&route, class);
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
