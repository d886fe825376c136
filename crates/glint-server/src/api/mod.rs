pub mod ws;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use glint_core::now_unix_millis;

/// Create the main router: health endpoints plus the websocket upgrade.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "glint conversation orchestrator",
        "status": "running",
        "timestamp_ms": now_unix_millis(),
        "active_connections": state.connection_count(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp_ms": now_unix_millis(),
        "active_connections": state.connection_count(),
        "parked_memories": state.parked_count().await,
        "config": {
            "sample_rate": state.config.sample_rate,
            "min_speech_duration_s": state.config.min_speech_duration_s,
            "max_speech_duration_s": state.config.max_speech_duration_s,
            "memory_max_tokens": state.config.memory_max_tokens,
            "voice_preset": state.config.voice_preset,
        },
    }))
}
