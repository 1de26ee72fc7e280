use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use http_body_util::LengthLimitError;
use std::convert::Infallible;
use std::error::Error as _;

use crate::error::GatewayError;
use crate::metrics::{REQUEST_REJECTED, REQUEST_TOTAL};
use crate::sse::to_sse_event;
use crate::state::AppState;

// POST /api/generate
pub async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    REQUEST_TOTAL.inc();

    match admit(&state, &headers, body).await {
        Ok(response) => response,
        Err(err) => {
            REQUEST_REJECTED.with_label_values(&[err.code()]).inc();
            tracing::info!(code = err.code(), status = %err.status(), "generation rejected");
            err.into_response()
        }
    }
}

async fn admit(state: &AppState, headers: &HeaderMap, body: Body) -> Result<Response, GatewayError> {
    let limit = state.config.limits.max_body_bytes;
    let bytes = to_bytes(body, limit)
        .await
        .map_err(|err| body_error(err, limit))?;

    let authorization = match headers.get(header::AUTHORIZATION) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| GatewayError::Unauthorized("malformed authorization header".into()))?,
        ),
        None => None,
    };

    let generation = state.orchestrator.admit(&bytes, authorization).await?;
    let events = state.orchestrator.start(generation).filter_map(|event| async move {
        match to_sse_event(&event) {
            Ok(frame) => Some(Ok::<Event, Infallible>(frame)),
            Err(err) => {
                tracing::error!(error = %err, kind = event.kind(), "failed to encode event");
                None
            }
        }
    });

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn body_error(err: axum::Error, limit: usize) -> GatewayError {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return GatewayError::PayloadTooLarge { limit };
        }
        source = cause.source();
    }
    GatewayError::Internal(format!("failed to read request body: {err}"))
}
