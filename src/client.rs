use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use thiserror::Error;

use crate::events::StreamEvent;
use crate::models::GenerationRequest;
use crate::sse::{DecodeError, SseDecoder};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ClientError>>;

/// HTTP client for a running gateway.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Starts a generation and returns its events as they arrive.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<EventStream, ClientError> {
        let mut builder = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(body);
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(decode(response.bytes_stream().boxed()))
    }

    pub async fn stop(&self, session_id: &str) -> Result<bool, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/generate/stop", self.base_url))
            .json(&serde_json::json!({ "sessionId": session_id }))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

struct DecodeState {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamEvent, ClientError>>,
    finished: bool,
}

fn decode(bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>) -> EventStream {
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let decoded = state.decoder.push(&chunk);
                    state
                        .pending
                        .extend(decoded.into_iter().map(|r| r.map_err(ClientError::from)));
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(ClientError::from(err)), state));
                }
                None => {
                    state.finished = true;
                    if let Some(tail) = state.decoder.finish() {
                        state.pending.push_back(tail.map_err(ClientError::from));
                    }
                }
            }
        }
    })
    .boxed()
}
