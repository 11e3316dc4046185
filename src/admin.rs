//! Administrative HTTP surface: health, status, reload, link checks,
//! source export and credential reset.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{LinkCheckError, PoolError};

/// Build the admin router over a running engine.
pub fn admin_routes(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/reload", post(reload))
        .route("/api/link-check", post(link_check))
        .route("/api/sources", get(sources))
        .route("/api/dialogs", get(dialogs))
        .route("/api/credentials/{id}/reset", post(reset_credential))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(engine)
}

/// Bind `addr` and serve the admin router in the background.
pub async fn spawn_admin_server(
    engine: Arc<Engine>,
    addr: SocketAddr,
) -> std::io::Result<(JoinHandle<()>, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = admin_routes(engine);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Admin server stopped: {e}");
        }
    });
    info!(addr = %local, "Admin server started");
    Ok((handle, local))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "feed-relay"
    }))
}

async fn status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.get_status().await)
}

async fn reload(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.reload_config().await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

async fn link_check(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.trigger_link_check().await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e @ LinkCheckError::Disabled) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e @ LinkCheckError::NoSession) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

async fn sources(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(serde_json::json!({ "sources": engine.export_sources() }))
}

async fn dialogs(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.export_dialogs())
}

async fn reset_credential(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.pool().reset(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "reset", "credential": id})),
        ),
        Err(PoolError::UnknownCredential(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown credential"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
