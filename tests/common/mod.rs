#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::SecretString;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ensemble_gateway::config::GatewayConfig;
use ensemble_gateway::error::{ProviderError, StoreError};
use ensemble_gateway::events::StreamEvent;
use ensemble_gateway::models::Usage;
use ensemble_gateway::orchestrator::Orchestrator;
use ensemble_gateway::provider::{ChatProvider, ChatRequest, FrameStream, ProviderFrame};
use ensemble_gateway::rate_limit::{RateConfig, TokenBucketLimiter};
use ensemble_gateway::session_lock::{InMemorySessionLock, LockToken, SessionLock};
use ensemble_gateway::stream_client::StreamPolicy;

pub const KEY: &str = "sk-or-v1-0123456789abcdef";

pub fn bearer() -> String {
    format!("Bearer {KEY}")
}

pub fn credential() -> SecretString {
    SecretString::new(KEY.to_string())
}

#[derive(Debug, Clone)]
pub enum Step {
    Frame(ProviderFrame),
    Delay(Duration),
    Fail(ProviderError),
}

/// What one call to `stream` does.
#[derive(Debug, Clone)]
pub enum Attempt {
    Reject(ProviderError),
    Stream(Vec<Step>),
}

impl Attempt {
    pub fn ok(content: &str) -> Self {
        Attempt::Stream(vec![
            Step::Frame(ProviderFrame::Content(content.to_string())),
            Step::Frame(ProviderFrame::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
            })),
        ])
    }

    pub fn status(code: u16, message: &str) -> Self {
        Attempt::Reject(ProviderError::from_status(code, message))
    }

    pub fn hang() -> Self {
        Attempt::Stream(vec![Step::Delay(Duration::from_secs(600))])
    }
}

/// Provider double that replays a queue of attempts per model. An empty queue
/// answers "ok".
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Attempt>>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, model: &str, attempts: Vec<Attempt>) -> Self {
        self.scripts
            .lock()
            .expect("scripts")
            .insert(model.to_string(), attempts.into());
        self
    }

    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls().iter().filter(|c| c.model == model).count()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream(
        &self,
        request: ChatRequest,
        _credential: &SecretString,
    ) -> Result<FrameStream, ProviderError> {
        let next = self
            .scripts
            .lock()
            .expect("scripts")
            .get_mut(&request.model)
            .and_then(VecDeque::pop_front);
        self.calls.lock().expect("calls").push(request);

        let steps = match next.unwrap_or_else(|| Attempt::ok("ok")) {
            Attempt::Reject(error) => return Err(error),
            Attempt::Stream(steps) => VecDeque::from(steps),
        };
        Ok(stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    Step::Delay(delay) => tokio::time::sleep(delay).await,
                    Step::Frame(frame) => return Some((Ok(frame), steps)),
                    Step::Fail(error) => {
                        steps.clear();
                        return Some((Err(error), steps));
                    }
                }
            }
        })
        .boxed())
    }
}

pub fn fast_policy() -> StreamPolicy {
    StreamPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(20),
        jitter: false,
        initial_timeout: Duration::from_secs(5),
        activity_timeout: Duration::from_secs(5),
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        stream: fast_policy(),
        rate: RateConfig::per_window(100, Duration::from_secs(60)),
        ..GatewayConfig::default()
    }
}

pub fn orchestrator(provider: Arc<ScriptedProvider>, config: GatewayConfig) -> Arc<Orchestrator> {
    orchestrator_with_locks(provider, config, Arc::new(InMemorySessionLock::new()))
}

/// Orchestrators sharing one lock store behave like replicas behind one Redis.
pub fn orchestrator_with_locks(
    provider: Arc<ScriptedProvider>,
    config: GatewayConfig,
    locks: Arc<dyn SessionLock>,
) -> Arc<Orchestrator> {
    let rate = config.rate;
    Arc::new(Orchestrator::new(
        provider,
        Arc::new(TokenBucketLimiter::new(rate)),
        locks,
        Arc::new(config),
    ))
}

/// Lock store that is always down.
pub struct UnreachableLocks;

#[async_trait]
impl SessionLock for UnreachableLocks {
    async fn acquire(&self, _: &str, _: Duration) -> Result<Option<LockToken>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn release(&self, _: &str, _: &LockToken) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Asserts the lifecycle every stream must follow: per instance one start
/// first and one terminal last, and a single `complete` at the very end.
pub fn assert_well_formed(events: &[StreamEvent]) {
    assert_eq!(events.last(), Some(&StreamEvent::Complete), "complete must be last");
    assert_eq!(
        events.iter().filter(|e| **e == StreamEvent::Complete).count(),
        1,
        "exactly one complete"
    );

    let mut seen: HashMap<&str, (bool, bool)> = HashMap::new();
    for event in events {
        let Some(instance) = event.instance_id() else {
            continue;
        };
        let (started, finished) = seen.entry(instance).or_default();
        assert!(!*finished, "{} after terminal for {instance}", event.kind());
        match event {
            StreamEvent::ModelStart { .. } => {
                assert!(!*started, "second model_start for {instance}");
                *started = true;
            }
            _ => assert!(*started, "{} before model_start for {instance}", event.kind()),
        }
        if event.is_instance_terminal() {
            *finished = true;
        }
    }
    for (instance, (_, finished)) in seen {
        assert!(finished, "{instance} never reached a terminal event");
    }
}

pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::kind).collect()
}
