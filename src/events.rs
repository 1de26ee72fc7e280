use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Every event the gateway streams to a client. The `type` field is the
/// discriminant on the wire; remaining fields are camelCase.
///
/// Per instance: exactly one `ModelStart`, then chunks/reasoning, then exactly
/// one of `ModelComplete` or `ModelError`. Per request: exactly one
/// `Complete`, always last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    ModelStart {
        instance_id: String,
        model_id: String,
    },
    ModelChunk {
        instance_id: String,
        model_id: String,
        content: String,
    },
    ModelReasoning {
        instance_id: String,
        model_id: String,
        reasoning: String,
    },
    ModelComplete {
        instance_id: String,
        model_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        word_count: usize,
    },
    ModelError {
        instance_id: String,
        model_id: String,
        error: String,
    },
    SynthesisStart {
        model_id: String,
    },
    SynthesisChunk {
        content: String,
    },
    SynthesisComplete {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        word_count: usize,
    },
    Warning {
        warning: String,
    },
    Error {
        error: String,
    },
    DebugPrompt {
        content: String,
    },
    Complete,
}

impl StreamEvent {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            StreamEvent::ModelStart { instance_id, .. }
            | StreamEvent::ModelChunk { instance_id, .. }
            | StreamEvent::ModelReasoning { instance_id, .. }
            | StreamEvent::ModelComplete { instance_id, .. }
            | StreamEvent::ModelError { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }

    pub fn is_instance_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ModelComplete { .. } | StreamEvent::ModelError { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ModelStart { .. } => "model_start",
            StreamEvent::ModelChunk { .. } => "model_chunk",
            StreamEvent::ModelReasoning { .. } => "model_reasoning",
            StreamEvent::ModelComplete { .. } => "model_complete",
            StreamEvent::ModelError { .. } => "model_error",
            StreamEvent::SynthesisStart { .. } => "synthesis_start",
            StreamEvent::SynthesisChunk { .. } => "synthesis_chunk",
            StreamEvent::SynthesisComplete { .. } => "synthesis_complete",
            StreamEvent::Warning { .. } => "warning",
            StreamEvent::Error { .. } => "error",
            StreamEvent::DebugPrompt { .. } => "debug_prompt",
            StreamEvent::Complete => "complete",
        }
    }
}

/// Outbound event channel shared by every task of one generation.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    // A closed receiver means the client went away; cancellation handles the rest.
    pub fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }
}
