use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::events::{EventSink, StreamEvent};
use crate::metrics::{ACTIVE_GENERATIONS, REQUEST_LATENCY, SYNTHESIS_TOTAL};
use crate::models::{ChatMessage, ModelOutcome, word_count};
use crate::provider::ChatProvider;
use crate::rate_limit::{RateLimiter, check_or_admit};
use crate::session_lock::{
    LockOutcome, LockToken, SessionLock, acquire_or_allow, release_quietly,
};
use crate::stream_client::{DeltaSink, ModelStreamClient, StreamOutcome};
use crate::synthesis;
use crate::validation::{
    ValidatedRequest, check_policy, identity_of, parse_request, resolve_credential, validate,
};

pub const ALL_MODELS_FAILED: &str = "All models failed to generate a response";

/// Events for one generation. Dropping the stream cancels the generation.
pub type GenerationStream = BoxStream<'static, StreamEvent>;

struct Running {
    owner: u64,
    cancel: CancellationToken,
}

/// A session reserved by one generation: its entry in the cancel registry
/// and, when the lock store answered, its lock token. Dropping a claim that
/// was never released frees both.
struct SessionClaim {
    session_id: String,
    owner: u64,
    token: Option<LockToken>,
    locks: Arc<dyn SessionLock>,
    running: Arc<DashMap<String, Running>>,
}

impl SessionClaim {
    async fn release(mut self) {
        self.running
            .remove_if(&self.session_id, |_, entry| entry.owner == self.owner);
        if let Some(token) = self.token.take() {
            release_quietly(self.locks.as_ref(), &self.session_id, &token).await;
        }
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.running
            .remove_if(&self.session_id, |_, entry| entry.owner == self.owner);
        let Some(token) = self.token.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let locks = Arc::clone(&self.locks);
            let session_id = std::mem::take(&mut self.session_id);
            runtime.spawn(async move {
                release_quietly(locks.as_ref(), &session_id, &token).await;
            });
        }
    }
}

/// An admitted request: validated, rate-limited, and holding its session.
/// A generation that is dropped without being started gives the session back.
pub struct Generation {
    id: u64,
    validated: ValidatedRequest,
    credential: SecretString,
    cancel: CancellationToken,
    claim: Option<SessionClaim>,
    admitted_at: Instant,
}

impl Generation {
    pub fn session_id(&self) -> Option<&str> {
        self.claim.as_ref().map(|claim| claim.session_id.as_str())
    }
}

pub struct Orchestrator {
    client: ModelStreamClient,
    limiter: Arc<dyn RateLimiter>,
    locks: Arc<dyn SessionLock>,
    config: Arc<GatewayConfig>,
    running: Arc<DashMap<String, Running>>,
    active: AtomicUsize,
    next_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        limiter: Arc<dyn RateLimiter>,
        locks: Arc<dyn SessionLock>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            client: ModelStreamClient::new(provider, config.stream.clone()),
            limiter,
            locks,
            config,
            running: Arc::new(DashMap::new()),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn active_generations(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Every check that can reject a request before streaming, in order:
    /// size, shape, policy, credential, rate limit, session lock.
    pub async fn admit(
        &self,
        body: &[u8],
        authorization: Option<&str>,
    ) -> Result<Generation, GatewayError> {
        let limits = &self.config.limits;
        if body.len() > limits.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge {
                limit: limits.max_body_bytes,
            });
        }

        let request = parse_request(body)?;
        let validated = validate(
            request,
            limits,
            &self.config.synthesis,
            self.config.refinement_model.as_deref(),
        )?;
        check_policy(&validated.request)?;
        let credential = resolve_credential(authorization, self.config.api_key.as_ref())?;

        let decision = check_or_admit(self.limiter.as_ref(), &identity_of(&credential)).await;
        if !decision.admitted {
            return Err(GatewayError::RateLimited {
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let claim = match validated.request.session_id.clone() {
            Some(session) => Some(self.claim_session(session, id, &cancel).await?),
            None => None,
        };

        Ok(Generation {
            id,
            validated,
            credential,
            cancel,
            claim,
            admitted_at: Instant::now(),
        })
    }

    // A generation still registered in this process keeps its session even
    // after the store's lock has expired.
    async fn claim_session(
        &self,
        session_id: String,
        owner: u64,
        cancel: &CancellationToken,
    ) -> Result<SessionClaim, GatewayError> {
        match self.running.entry(session_id.clone()) {
            Entry::Occupied(_) => return Err(GatewayError::SessionBusy),
            Entry::Vacant(slot) => {
                slot.insert(Running {
                    owner,
                    cancel: cancel.clone(),
                });
            }
        }
        let mut claim = SessionClaim {
            session_id,
            owner,
            token: None,
            locks: Arc::clone(&self.locks),
            running: Arc::clone(&self.running),
        };

        match acquire_or_allow(self.locks.as_ref(), &claim.session_id, self.config.session_ttl)
            .await
        {
            LockOutcome::Held(token) => claim.token = Some(token),
            LockOutcome::Bypassed => {}
            LockOutcome::Busy => return Err(GatewayError::SessionBusy),
        }
        Ok(claim)
    }

    /// Spawns the generation and returns its event stream.
    pub fn start(self: &Arc<Self>, generation: Generation) -> GenerationStream {
        let cancel = generation.cancel.clone();
        let (events, rx) = EventSink::channel();
        self.active.fetch_add(1, Ordering::Relaxed);
        ACTIVE_GENERATIONS.inc();

        let span = tracing::info_span!(
            "generation",
            id = generation.id,
            models = generation.validated.request.models.len()
        );
        let orchestrator = Arc::clone(self);
        let supervisor_cancel = cancel.clone();
        tokio::spawn(
            async move {
                orchestrator
                    .supervise(generation, events, supervisor_cancel)
                    .await
            }
            .instrument(span),
        );

        let guard = cancel.drop_guard();
        stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (event, (rx, guard)))
        })
        .boxed()
    }

    /// Cancels the in-flight generation for `session_id` in this process.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.running.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    // Owns cleanup: whatever happens to the worker, the lock is released and
    // `complete` is the last event.
    async fn supervise(
        self: Arc<Self>,
        mut generation: Generation,
        events: EventSink,
        cancel: CancellationToken,
    ) {
        let claim = generation.claim.take();
        let admitted_at = generation.admitted_at;

        let worker = {
            let orchestrator = Arc::clone(&self);
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { orchestrator.run(generation, &events, &cancel).await }
                    .in_current_span(),
            )
        };
        if let Err(err) = worker.await {
            tracing::error!(error = %err, "generation worker failed");
            cancel.cancel();
            events.emit(StreamEvent::Error {
                error: ErrorKind::Unknown.user_message().to_string(),
            });
        }

        if let Some(claim) = claim {
            claim.release().await;
        }
        self.active.fetch_sub(1, Ordering::Relaxed);
        ACTIVE_GENERATIONS.dec();
        REQUEST_LATENCY.observe(admitted_at.elapsed().as_secs_f64());
        if cancel.is_cancelled() {
            tracing::info!("generation cancelled");
        }
        events.emit(StreamEvent::Complete);
    }

    async fn run(&self, generation: Generation, events: &EventSink, cancel: &CancellationToken) {
        let Generation {
            validated,
            credential,
            ..
        } = generation;
        let request = &validated.request;
        let credential = Arc::new(credential);
        let messages = Arc::new(request.conversation());
        let environment = self.config.environment;
        let instances = request.instances();

        let mut tasks = JoinSet::new();
        let mut slots = HashMap::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            let client = self.client.clone();
            let instance = instance.clone();
            let reasoning = request.reasoning_for(&instance.model_id);
            let messages = Arc::clone(&messages);
            let credential = Arc::clone(&credential);
            let events = events.clone();
            let cancel = cancel.clone();
            let handle = tasks.spawn(
                async move {
                    client
                        .run_instance(
                            &instance,
                            &messages,
                            reasoning,
                            &credential,
                            &events,
                            &cancel,
                            environment,
                        )
                        .await
                }
                .in_current_span(),
            );
            slots.insert(handle.id(), index);
        }

        let mut outcomes: Vec<Option<ModelOutcome>> = vec![None; instances.len()];
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(&index) = slots.get(&id) {
                        outcomes[index] = Some(outcome);
                    }
                }
                Err(err) => {
                    let Some(&index) = slots.get(&err.id()) else {
                        continue;
                    };
                    let instance = &instances[index];
                    tracing::error!(instance = %instance.instance_id, error = %err, "instance task failed");
                    events.emit(StreamEvent::ModelError {
                        instance_id: instance.instance_id.clone(),
                        model_id: instance.model_id.clone(),
                        error: ErrorKind::Unknown.user_message().to_string(),
                    });
                    outcomes[index] = Some(ModelOutcome::failed(instance));
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        let successes: Vec<ModelOutcome> = outcomes
            .into_iter()
            .flatten()
            .filter(ModelOutcome::is_usable)
            .collect();
        tracing::info!(
            succeeded = successes.len(),
            failed = instances.len() - successes.len(),
            "fan-out finished"
        );
        if successes.is_empty() {
            SYNTHESIS_TOTAL.with_label_values(&["skipped"]).inc();
            events.emit(StreamEvent::Error {
                error: ALL_MODELS_FAILED.to_string(),
            });
            return;
        }

        self.synthesize(&validated, &successes, &credential, events, cancel)
            .await;
    }

    async fn synthesize(
        &self,
        validated: &ValidatedRequest,
        successes: &[ModelOutcome],
        credential: &SecretString,
        events: &EventSink,
        cancel: &CancellationToken,
    ) {
        let request = &validated.request;
        let context = synthesis::build(&request.prompt, successes, &validated.budget);
        if !context.within_limit {
            tracing::warn!(
                estimated_tokens = context.estimated_tokens,
                "synthesis input over budget, continuing"
            );
        }
        if let Some(warning) = context.warning() {
            events.emit(StreamEvent::Warning { warning });
        }
        if self.config.debug_prompts {
            events.emit(StreamEvent::DebugPrompt {
                content: context.prompt.clone(),
            });
        }

        let model_id = validated.synthesis_model.clone();
        events.emit(StreamEvent::SynthesisStart {
            model_id: model_id.clone(),
        });

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(context.prompt));

        let sink = SynthesisSink { events };
        let outcome = self
            .client
            .stream(&model_id, &messages, None, credential, &sink, cancel)
            .await;
        match outcome {
            StreamOutcome::Complete { content, usage } => {
                SYNTHESIS_TOTAL.with_label_values(&["complete"]).inc();
                events.emit(StreamEvent::SynthesisComplete {
                    word_count: word_count(&content),
                    tokens: usage.map(|u| u.total_tokens),
                    content,
                });
            }
            StreamOutcome::Failed(error) => {
                SYNTHESIS_TOTAL.with_label_values(&[error.kind.as_str()]).inc();
                tracing::warn!(kind = %error.kind, status = ?error.status, "synthesis failed");
                events.emit(StreamEvent::Error {
                    error: format!(
                        "Synthesis failed: {}",
                        error.safe_message(self.config.environment)
                    ),
                });
            }
            StreamOutcome::Cancelled => {
                SYNTHESIS_TOTAL.with_label_values(&["cancelled"]).inc();
            }
        }
    }
}

struct SynthesisSink<'a> {
    events: &'a EventSink,
}

impl DeltaSink for SynthesisSink<'_> {
    fn content(&self, fragment: &str) {
        self.events.emit(StreamEvent::SynthesisChunk {
            content: fragment.to_string(),
        });
    }

    // synthesis reasoning is not forwarded
    fn reasoning(&self, _fragment: &str) {}
}
