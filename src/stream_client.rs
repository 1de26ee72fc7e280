use futures::StreamExt;
use rand::Rng;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::config::Environment;
use crate::error::{ErrorKind, ProviderError};
use crate::events::{EventSink, StreamEvent};
use crate::metrics::{MODEL_STREAMS, STREAM_RETRIES};
use crate::models::{ChatMessage, ModelInstance, ModelOutcome, ReasoningConfig, Usage, word_count};
use crate::provider::{ChatProvider, ChatRequest, ProviderFrame};

/// Retry and watchdog settings applied to every provider stream.
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Budget for the first frame of an attempt (queueing, cold starts).
    pub initial_timeout: Duration,
    /// Budget between frames once data is flowing.
    pub activity_timeout: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            initial_timeout: Duration::from_secs(120),
            activity_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamPolicy {
    /// Delay before retry number `attempt + 1`. Jitter stays below a quarter
    /// of the delay, so uncapped delays remain strictly increasing.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let delay = exponential_backoff(self.base_delay, attempt).min(self.max_delay);
        if !self.jitter {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..spread))
    }
}

pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Receives fragments as they arrive.
pub trait DeltaSink: Send + Sync {
    fn content(&self, fragment: &str);
    fn reasoning(&self, fragment: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Complete {
        content: String,
        usage: Option<Usage>,
    },
    Failed(ProviderError),
    Cancelled,
}

enum Attempt {
    Complete {
        content: String,
        usage: Option<Usage>,
    },
    Failed(ProviderError),
    Cancelled,
}

#[derive(Clone)]
pub struct ModelStreamClient {
    provider: Arc<dyn ChatProvider>,
    policy: StreamPolicy,
}

impl ModelStreamClient {
    pub fn new(provider: Arc<dyn ChatProvider>, policy: StreamPolicy) -> Self {
        Self { provider, policy }
    }

    /// Streams one model to completion, retrying transient failures.
    pub async fn stream(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        reasoning: Option<ReasoningConfig>,
        credential: &SecretString,
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let mut reasoning = reasoning;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return StreamOutcome::Cancelled;
            }

            let request = ChatRequest {
                model: model_id.to_string(),
                messages: messages.to_vec(),
                reasoning: reasoning.clone(),
            };
            let error = match self.attempt(request, credential, sink, cancel).await {
                Attempt::Complete { content, usage } => {
                    return StreamOutcome::Complete { content, usage };
                }
                Attempt::Cancelled => return StreamOutcome::Cancelled,
                Attempt::Failed(error) => error,
            };

            if error.kind == ErrorKind::CapabilityUnsupported && reasoning.is_some() {
                tracing::warn!(model = model_id, "reasoning rejected, retrying without it");
                reasoning = None;
                continue;
            }

            if !error.kind.is_retryable() || attempt >= self.policy.max_retries {
                return StreamOutcome::Failed(error);
            }

            let delay = self.policy.retry_delay(attempt);
            STREAM_RETRIES.inc();
            tracing::debug!(
                model = model_id,
                attempt = attempt + 1,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "retrying provider stream"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    // A single try. The watchdog deadline starts long and shortens after the first frame.
    async fn attempt(
        &self,
        request: ChatRequest,
        credential: &SecretString,
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Attempt {
        let mut deadline = Instant::now() + self.policy.initial_timeout;
        let mut waited = self.policy.initial_timeout;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            opened = timeout_at(deadline, self.provider.stream(request, credential)) => opened,
        };
        let mut frames = match opened {
            Ok(Ok(frames)) => frames,
            Ok(Err(error)) => return Attempt::Failed(error),
            Err(_) => {
                return Attempt::Failed(ProviderError::timeout(format!(
                    "no response within {waited:?}"
                )));
            }
        };

        let mut content = String::new();
        let mut usage = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled,
                next = timeout_at(deadline, frames.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    return Attempt::Failed(ProviderError::timeout(format!(
                        "no data within {waited:?}"
                    )));
                }
                Ok(None) => return Attempt::Complete { content, usage },
                Ok(Some(Err(error))) => return Attempt::Failed(error),
                Ok(Some(Ok(frame))) => frame,
            };

            waited = self.policy.activity_timeout;
            deadline = Instant::now() + waited;
            match frame {
                ProviderFrame::Content(text) => {
                    content.push_str(&text);
                    sink.content(&text);
                }
                ProviderFrame::Reasoning(text) => sink.reasoning(&text),
                ProviderFrame::Usage(reported) => usage = Some(reported),
                ProviderFrame::Error(error) => return Attempt::Failed(error),
            }
        }
    }

    /// Runs one model instance end to end, emitting its full event lifecycle.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_instance(
        &self,
        instance: &ModelInstance,
        messages: &[ChatMessage],
        reasoning: Option<ReasoningConfig>,
        credential: &SecretString,
        events: &EventSink,
        cancel: &CancellationToken,
        environment: Environment,
    ) -> ModelOutcome {
        events.emit(StreamEvent::ModelStart {
            instance_id: instance.instance_id.clone(),
            model_id: instance.model_id.clone(),
        });

        let sink = InstanceSink { instance, events };
        let outcome = self
            .stream(&instance.model_id, messages, reasoning, credential, &sink, cancel)
            .await;

        match outcome {
            StreamOutcome::Complete { content, usage } => {
                MODEL_STREAMS.with_label_values(&["complete"]).inc();
                events.emit(StreamEvent::ModelComplete {
                    instance_id: instance.instance_id.clone(),
                    model_id: instance.model_id.clone(),
                    content: content.clone(),
                    tokens: usage.map(|u| u.total_tokens),
                    word_count: word_count(&content),
                });
                ModelOutcome {
                    instance_id: instance.instance_id.clone(),
                    model_id: instance.model_id.clone(),
                    content,
                    success: true,
                    usage,
                }
            }
            StreamOutcome::Failed(error) => {
                MODEL_STREAMS.with_label_values(&[error.kind.as_str()]).inc();
                tracing::warn!(
                    instance = %instance.instance_id,
                    kind = %error.kind,
                    status = ?error.status,
                    "model instance failed"
                );
                events.emit(StreamEvent::ModelError {
                    instance_id: instance.instance_id.clone(),
                    model_id: instance.model_id.clone(),
                    error: error.safe_message(environment),
                });
                ModelOutcome::failed(instance)
            }
            StreamOutcome::Cancelled => {
                MODEL_STREAMS.with_label_values(&["cancelled"]).inc();
                events.emit(StreamEvent::ModelError {
                    instance_id: instance.instance_id.clone(),
                    model_id: instance.model_id.clone(),
                    error: ErrorKind::Cancelled.user_message().to_string(),
                });
                ModelOutcome::failed(instance)
            }
        }
    }
}

struct InstanceSink<'a> {
    instance: &'a ModelInstance,
    events: &'a EventSink,
}

impl DeltaSink for InstanceSink<'_> {
    fn content(&self, fragment: &str) {
        self.events.emit(StreamEvent::ModelChunk {
            instance_id: self.instance.instance_id.clone(),
            model_id: self.instance.model_id.clone(),
            content: fragment.to_string(),
        });
    }

    fn reasoning(&self, fragment: &str) {
        self.events.emit(StreamEvent::ModelReasoning {
            instance_id: self.instance.instance_id.clone(),
            model_id: self.instance.model_id.clone(),
            reasoning: fragment.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(250);
        assert_eq!(exponential_backoff(base, 0), Duration::from_millis(250));
        assert_eq!(exponential_backoff(base, 3), Duration::from_secs(2));
        for k in 0..10 {
            assert!(exponential_backoff(base, k) < exponential_backoff(base, k + 1));
        }
    }

    #[test]
    fn jittered_delays_stay_monotonic_under_cap() {
        let policy = StreamPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3600),
            ..StreamPolicy::default()
        };
        for _ in 0..50 {
            for k in 0..5 {
                assert!(policy.retry_delay(k) < policy.retry_delay(k + 1));
            }
        }
    }

    #[test]
    fn delay_respects_cap_without_jitter() {
        let policy = StreamPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..StreamPolicy::default()
        };
        assert_eq!(policy.retry_delay(10), Duration::from_secs(5));
    }
}
