//! Router configuration for the live-update endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::Vault;

use super::error::ApiError;
use super::ws::ws_handler;

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    /// The vault whose notifier feeds the socket.
    pub vault: Vault,
}

impl AppState {
    /// Create a new application state.
    pub fn new(vault: Vault) -> Self {
        Self { vault }
    }
}

/// Create the main router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(create_health_router())
}

/// Create a health check router.
pub fn create_health_router() -> Router {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check() -> &'static str {
    "OK"
}

/// Body of `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Applied schema migrations.
    pub schema_version: i64,
    /// Connected live-update subscribers.
    pub subscribers: usize,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let schema_version = state.vault.db().schema_version().await?;
    let subscribers = state.vault.notifier().subscriber_count().await;
    Ok(Json(StatusResponse {
        schema_version,
        subscribers,
    }))
}
