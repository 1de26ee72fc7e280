use axum::{Json, extract::State, response::IntoResponse};

use crate::state::AppState;

// health handler
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "activeGenerations": state.orchestrator.active_generations(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
