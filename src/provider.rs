//! Upstream model provider contract and the OpenAI-compatible HTTP client.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{ErrorKind, ProviderError};
use crate::models::{ChatMessage, ReasoningConfig, Usage};
use crate::sse::FrameBuffer;

/// One normalized piece of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    Content(String),
    Reasoning(String),
    Usage(Usage),
    /// An error reported inside an otherwise healthy stream.
    Error(ProviderError),
}

pub type FrameStream = BoxStream<'static, Result<ProviderFrame, ProviderError>>;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub reasoning: Option<ReasoningConfig>,
}

/// `stream(request) -> frames | error`. Errors returned from `stream` itself
/// happen before any frame (HTTP status, connect failure); `Err` items are
/// transport failures mid-stream.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream(
        &self,
        request: ChatRequest,
        credential: &SecretString,
    ) -> Result<FrameStream, ProviderError>;
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningBody>,
    usage: UsageOption,
}

#[derive(Serialize)]
struct ReasoningBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    effort: Option<crate::models::ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude: Option<bool>,
}

impl From<&ReasoningConfig> for ReasoningBody {
    fn from(config: &ReasoningConfig) -> Self {
        Self {
            effort: config.effort,
            max_tokens: config.max_tokens,
            exclude: config.exclude,
        }
    }
}

#[derive(Serialize)]
struct UsageOption {
    include: bool,
}

#[derive(Deserialize, Debug)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize, Debug)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ErrorDetail {
    fn into_provider_error(self) -> ProviderError {
        let status = self.code.as_ref().and_then(|code| match code {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        match status {
            Some(status) => ProviderError::from_status(status, self.message),
            None => ProviderError {
                kind: ErrorKind::from_status(0, &self.message),
                status: None,
                message: self.message,
            },
        }
    }
}

/// Sentinel payload that ends an OpenAI-style stream.
const DONE: &str = "[DONE]";

/// Turns one `data:` payload into zero or more frames.
pub fn parse_payload(payload: &str) -> Result<Vec<ProviderFrame>, ProviderError> {
    let chunk: CompletionChunk = serde_json::from_str(payload).map_err(|err| {
        ProviderError::new(ErrorKind::Unknown, format!("malformed stream chunk: {err}"))
    })?;

    if let Some(detail) = chunk.error {
        return Ok(vec![ProviderFrame::Error(detail.into_provider_error())]);
    }

    let mut frames = Vec::new();
    for choice in chunk.choices {
        let reasoning = choice.delta.reasoning.or(choice.delta.reasoning_content);
        if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
            frames.push(ProviderFrame::Reasoning(text));
        }
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            frames.push(ProviderFrame::Content(text));
        }
        if choice.finish_reason.as_deref() == Some("error") {
            frames.push(ProviderFrame::Error(ProviderError::new(
                ErrorKind::ProviderUnavailable,
                "provider ended the stream with an error",
            )));
        }
    }
    if let Some(usage) = chunk.usage {
        frames.push(ProviderFrame::Usage(usage));
    }
    Ok(frames)
}

/// OpenAI-compatible chat completions client (OpenRouter by default).
#[derive(Clone)]
pub struct OpenRouterProvider {
    http: reqwest::Client,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

struct ParseState {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    frames: FrameBuffer,
    pending: VecDeque<Result<ProviderFrame, ProviderError>>,
    done: bool,
}

impl ParseState {
    fn absorb(&mut self, payloads: Vec<String>) {
        for payload in payloads {
            if self.done {
                return;
            }
            if payload.trim() == DONE {
                self.done = true;
                return;
            }
            match parse_payload(&payload) {
                Ok(frames) => self.pending.extend(frames.into_iter().map(Ok)),
                Err(err) => {
                    self.pending.push_back(Err(err));
                    self.done = true;
                }
            }
        }
    }
}

fn frames_from_bytes(bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>) -> FrameStream {
    let state = ParseState {
        bytes,
        frames: FrameBuffer::new(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let payloads = state.frames.push(&chunk);
                    state.absorb(payloads);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(ProviderError::from(err)), state));
                }
                None => {
                    let tail = state.frames.finish().into_iter().collect();
                    state.absorb(tail);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ChatProvider for OpenRouterProvider {
    async fn stream(
        &self,
        request: ChatRequest,
        credential: &SecretString,
    ) -> Result<FrameStream, ProviderError> {
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            reasoning: request.reasoning.as_ref().map(ReasoningBody::from),
            usage: UsageOption { include: true },
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(credential.expose_secret())
            .header("X-Title", "ensemble-gateway")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|envelope| envelope.error.message)
                .unwrap_or(text);
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        Ok(frames_from_bytes(response.bytes_stream().boxed()))
    }
}
