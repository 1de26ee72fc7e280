use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

// POST /api/generate/stop
pub async fn stop_handler(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> Result<Json<StopResponse>, GatewayError> {
    if state.orchestrator.cancel(&request.session_id) {
        tracing::info!(session = %request.session_id, "generation stop requested");
        Ok(Json(StopResponse { stopped: true }))
    } else {
        Err(GatewayError::NotFound(
            "no generation is running for this session".into(),
        ))
    }
}
