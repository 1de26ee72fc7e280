mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::{Attempt, ScriptedProvider, assert_well_formed, bearer, orchestrator, test_config};
use ensemble_gateway::build_router;
use ensemble_gateway::config::GatewayConfig;
use ensemble_gateway::events::StreamEvent;
use ensemble_gateway::rate_limit::RateConfig;
use ensemble_gateway::sse::SseDecoder;
use ensemble_gateway::state::AppState;

fn app_state(provider: ScriptedProvider, config: GatewayConfig) -> AppState {
    AppState::new(orchestrator(Arc::new(provider), config))
}

fn generate_request(body: Value, auth: bool) -> Request<Body> {
    let mut builder = Request::post("/api/generate").header(header::CONTENT_TYPE, "application/json");
    if auth {
        builder = builder.header(header::AUTHORIZATION, bearer());
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).expect("body")))
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn successful_generation_streams_sse_frames() {
    let state = app_state(ScriptedProvider::new(), test_config());
    let response = build_router(state)
        .oneshot(generate_request(json!({"prompt": "hi", "models": ["m1", "m2"]}), true))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let bytes = tokio::time::timeout(Duration::from_secs(10), response.into_body().collect())
        .await
        .expect("stream finished")
        .expect("body")
        .to_bytes();
    let mut decoder = SseDecoder::new();
    let events: Vec<StreamEvent> = decoder
        .push(&bytes)
        .into_iter()
        .map(|event| event.expect("decodable frame"))
        .collect();

    assert_well_formed(&events);
    assert!(events.iter().any(|e| matches!(e, StreamEvent::SynthesisComplete { .. })));
}

#[tokio::test]
async fn rejections_map_to_status_codes() {
    let state = app_state(ScriptedProvider::new(), test_config());
    let cases = [
        (json!({"prompt": "", "models": ["m1"]}), true, StatusCode::BAD_REQUEST, "bad_request"),
        (json!({"prompt": "hi", "models": []}), true, StatusCode::BAD_REQUEST, "bad_request"),
        (json!({"prompt": "hi", "models": ["m1"]}), false, StatusCode::UNAUTHORIZED, "unauthorized"),
        (
            json!({"prompt": "see vbscript:msgbox", "models": ["m1"]}),
            true,
            StatusCode::FORBIDDEN,
            "policy_rejected",
        ),
    ];
    for (body, auth, status, code) in cases {
        let response = build_router(state.clone())
            .oneshot(generate_request(body, auth))
            .await
            .expect("response");
        assert_eq!(response.status(), status);
        assert_eq!(json_body(response).await["code"], code);
    }
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let state = app_state(ScriptedProvider::new(), test_config());
    let request = Request::post("/api/generate")
        .header(header::AUTHORIZATION, bearer())
        .body(Body::from("{not json"))
        .expect("request");
    let response = build_router(state).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut config = test_config();
    config.limits.max_body_bytes = 256;
    let state = app_state(ScriptedProvider::new(), config);

    let response = build_router(state)
        .oneshot(generate_request(
            json!({"prompt": "x".repeat(1024), "models": ["m1"]}),
            true,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[test]
fn state_shares_the_orchestrator_config() {
    let state = app_state(ScriptedProvider::new(), test_config());
    assert!(Arc::ptr_eq(&state.config, state.orchestrator.config()));
}

#[tokio::test]
async fn body_read_failure_is_an_internal_error() {
    let state = app_state(ScriptedProvider::new(), test_config());
    let chunks = futures::stream::iter(vec![
        Ok("{\"prompt\": \"hi\", "),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset")),
    ]);
    let request = Request::post("/api/generate")
        .header(header::AUTHORIZATION, bearer())
        .body(Body::from_stream(chunks))
        .expect("request");

    let response = build_router(state).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["code"], "internal");
    assert!(!body["error"].as_str().expect("message").contains("peer reset"));
}

#[tokio::test]
async fn rate_limited_requests_carry_retry_after() {
    let config = GatewayConfig {
        rate: RateConfig::per_window(1, Duration::from_secs(60)),
        ..test_config()
    };
    let state = app_state(ScriptedProvider::new(), config);
    let body = json!({"prompt": "hi", "models": ["m1"]});

    let first = build_router(state.clone())
        .oneshot(generate_request(body.clone(), true))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);

    let second = build_router(state)
        .oneshot(generate_request(body, true))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()[header::RETRY_AFTER]
        .to_str()
        .expect("ascii")
        .parse()
        .expect("seconds");
    assert!((59..=60).contains(&retry_after));
}

#[tokio::test]
async fn busy_session_conflicts_until_stopped() {
    let provider = ScriptedProvider::new().script("slow", vec![Attempt::hang()]);
    let state = app_state(provider, test_config());
    let body = json!({"prompt": "hi", "models": ["slow"], "sessionId": "s-1"});

    let running = build_router(state.clone())
        .oneshot(generate_request(body.clone(), true))
        .await
        .expect("response");
    assert_eq!(running.status(), StatusCode::OK);

    let conflict = build_router(state.clone())
        .oneshot(generate_request(body, true))
        .await
        .expect("response");
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(conflict).await["code"], "generation_in_progress");

    let stop = Request::post("/api/generate/stop")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"sessionId":"s-1"}"#))
        .expect("request");
    let stopped = build_router(state).oneshot(stop).await.expect("response");
    assert_eq!(stopped.status(), StatusCode::OK);

    let bytes = tokio::time::timeout(Duration::from_secs(5), running.into_body().collect())
        .await
        .expect("stream ends after stop")
        .expect("body")
        .to_bytes();
    let events: Vec<StreamEvent> = SseDecoder::new()
        .push(&bytes)
        .into_iter()
        .map(|event| event.expect("frame"))
        .collect();
    assert_well_formed(&events);
}

#[tokio::test]
async fn stop_without_generation_is_not_found() {
    let state = app_state(ScriptedProvider::new(), test_config());
    let stop = Request::post("/api/generate/stop")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"sessionId":"nobody"}"#))
        .expect("request");
    let response = build_router(state).oneshot(stop).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let state = app_state(ScriptedProvider::new(), test_config());

    let health = build_router(state.clone())
        .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["activeGenerations"], 0);

    let metrics = build_router(state)
        .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(metrics.status(), StatusCode::OK);
}
