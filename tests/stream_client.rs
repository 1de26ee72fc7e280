mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{Attempt, ScriptedProvider, Step, credential, fast_policy};
use ensemble_gateway::error::{ErrorKind, ProviderError};
use ensemble_gateway::models::{ChatMessage, ReasoningConfig};
use ensemble_gateway::provider::ProviderFrame;
use ensemble_gateway::stream_client::{DeltaSink, ModelStreamClient, StreamOutcome, StreamPolicy};

#[derive(Default)]
struct Recorder {
    content: Mutex<Vec<String>>,
    reasoning: Mutex<Vec<String>>,
}

impl DeltaSink for Recorder {
    fn content(&self, fragment: &str) {
        self.content.lock().expect("content").push(fragment.to_string());
    }

    fn reasoning(&self, fragment: &str) {
        self.reasoning.lock().expect("reasoning").push(fragment.to_string());
    }
}

async fn run(
    provider: &Arc<ScriptedProvider>,
    policy: StreamPolicy,
    reasoning: Option<ReasoningConfig>,
    cancel: &CancellationToken,
) -> (StreamOutcome, Recorder) {
    let client = ModelStreamClient::new(provider.clone(), policy);
    let sink = Recorder::default();
    let outcome = client
        .stream(
            "m",
            &[ChatMessage::user("What is 6*7?")],
            reasoning,
            &credential(),
            &sink,
            cancel,
        )
        .await;
    (outcome, sink)
}

fn content_of(outcome: &StreamOutcome) -> &str {
    match outcome {
        StreamOutcome::Complete { content, .. } => content,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn retries_unavailable_provider_until_success() {
    let provider = Arc::new(ScriptedProvider::new().script(
        "m",
        vec![
            Attempt::status(503, "overloaded"),
            Attempt::status(502, "bad gateway"),
            Attempt::ok("42"),
        ],
    ));
    let (outcome, sink) = run(&provider, fast_policy(), None, &CancellationToken::new()).await;

    assert_eq!(content_of(&outcome), "42");
    assert_eq!(provider.calls_for("m"), 3);
    assert_eq!(*sink.content.lock().expect("content"), vec!["42".to_string()]);
}

#[tokio::test]
async fn non_retryable_errors_fail_on_first_attempt() {
    let provider = Arc::new(ScriptedProvider::new().script("m", vec![Attempt::status(401, "bad key")]));
    let (outcome, _) = run(&provider, fast_policy(), None, &CancellationToken::new()).await;

    match outcome {
        StreamOutcome::Failed(error) => assert_eq!(error.kind, ErrorKind::Auth),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(provider.calls_for("m"), 1);
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let provider = Arc::new(ScriptedProvider::new().script(
        "m",
        vec![Attempt::status(503, "down"); 6],
    ));
    let policy = StreamPolicy {
        max_retries: 2,
        ..fast_policy()
    };
    let (outcome, _) = run(&provider, policy, None, &CancellationToken::new()).await;

    match outcome {
        StreamOutcome::Failed(error) => assert_eq!(error.kind, ErrorKind::ProviderUnavailable),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(provider.calls_for("m"), 3);
}

#[tokio::test]
async fn unsupported_reasoning_retries_once_without_it() {
    let provider = Arc::new(ScriptedProvider::new().script(
        "m",
        vec![
            Attempt::status(400, "Reasoning is not supported for this model"),
            Attempt::ok("plain answer"),
        ],
    ));
    let reasoning = ReasoningConfig {
        enabled: Some(true),
        ..ReasoningConfig::default()
    };
    let policy = StreamPolicy {
        max_retries: 0,
        ..fast_policy()
    };
    let (outcome, _) = run(&provider, policy, Some(reasoning), &CancellationToken::new()).await;

    assert_eq!(content_of(&outcome), "plain answer");
    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].reasoning.is_some());
    assert!(calls[1].reasoning.is_none());
}

#[tokio::test]
async fn error_frame_mid_stream_is_retried() {
    let provider = Arc::new(ScriptedProvider::new().script(
        "m",
        vec![
            Attempt::Stream(vec![
                Step::Frame(ProviderFrame::Reasoning("thinking".into())),
                Step::Frame(ProviderFrame::Content("par".into())),
                Step::Frame(ProviderFrame::Error(ProviderError::new(
                    ErrorKind::ProviderUnavailable,
                    "upstream reset",
                ))),
            ]),
            Attempt::ok("full"),
        ],
    ));
    let (outcome, sink) = run(&provider, fast_policy(), None, &CancellationToken::new()).await;

    assert_eq!(content_of(&outcome), "full");
    assert_eq!(*sink.reasoning.lock().expect("reasoning"), vec!["thinking".to_string()]);
}

#[tokio::test]
async fn silent_first_frame_trips_the_initial_watchdog() {
    let provider = Arc::new(ScriptedProvider::new().script(
        "m",
        vec![
            Attempt::Stream(vec![
                Step::Delay(Duration::from_secs(5)),
                Step::Frame(ProviderFrame::Content("too late".into())),
            ]),
            Attempt::ok("on time"),
        ],
    ));
    let policy = StreamPolicy {
        initial_timeout: Duration::from_millis(50),
        ..fast_policy()
    };
    let (outcome, _) = run(&provider, policy, None, &CancellationToken::new()).await;
    assert_eq!(content_of(&outcome), "on time");
}

#[tokio::test]
async fn stall_after_data_trips_the_activity_watchdog() {
    let provider = Arc::new(ScriptedProvider::new().script(
        "m",
        vec![Attempt::Stream(vec![
            Step::Frame(ProviderFrame::Content("a".into())),
            Step::Delay(Duration::from_secs(5)),
            Step::Frame(ProviderFrame::Content("b".into())),
        ])],
    ));
    let policy = StreamPolicy {
        max_retries: 0,
        activity_timeout: Duration::from_millis(50),
        ..fast_policy()
    };
    let (outcome, sink) = run(&provider, policy, None, &CancellationToken::new()).await;

    match outcome {
        StreamOutcome::Failed(error) => assert_eq!(error.kind, ErrorKind::Timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(*sink.content.lock().expect("content"), vec!["a".to_string()]);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (outcome, _) = run(&provider, fast_policy(), None, &cancel).await;

    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn cancellation_interrupts_a_hanging_stream() {
    let provider = Arc::new(ScriptedProvider::new().script("m", vec![Attempt::hang()]));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let (outcome, _) = run(&provider, fast_policy(), None, &cancel).await;
    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}
