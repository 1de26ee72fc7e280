use crate::events::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Streaming,
    Complete,
    Failed,
}

impl ModelStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ModelStatus::Streaming)
    }
}

/// What a UI shows for one model instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelView {
    pub instance_id: String,
    pub model_id: String,
    pub status: ModelStatus,
    pub content: String,
    pub reasoning: String,
    pub tokens: Option<u64>,
    pub word_count: usize,
    pub error: Option<String>,
}

impl ModelView {
    fn new(instance_id: &str, model_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            model_id: model_id.to_string(),
            status: ModelStatus::Streaming,
            content: String::new(),
            reasoning: String::new(),
            tokens: None,
            word_count: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynthesisStatus {
    #[default]
    Waiting,
    Streaming,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SynthesisView {
    pub model_id: Option<String>,
    pub status: SynthesisStatus,
    pub content: String,
    pub tokens: Option<u64>,
    pub word_count: usize,
}

/// Folds a generation's event stream into display state.
///
/// Models keep the order in which they first appeared. Events that would
/// break the per-instance lifecycle (anything after a terminal event, or
/// anything after `complete`) are ignored, so a misbehaving stream cannot
/// flip a finished model back to streaming.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientState {
    pub models: Vec<ModelView>,
    pub synthesis: SynthesisView,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub debug_prompt: Option<String>,
    pub done: bool,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self, instance_id: &str) -> Option<&ModelView> {
        self.models.iter().find(|m| m.instance_id == instance_id)
    }

    fn live_model(&mut self, instance_id: &str, model_id: &str) -> Option<&mut ModelView> {
        let index = match self.models.iter().position(|m| m.instance_id == instance_id) {
            Some(index) => index,
            None => {
                self.models.push(ModelView::new(instance_id, model_id));
                self.models.len() - 1
            }
        };
        let view = &mut self.models[index];
        (!view.status.is_terminal()).then_some(view)
    }

    /// Applies one event. Returns false when the event was ignored.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if self.done {
            return false;
        }

        match event {
            StreamEvent::ModelStart {
                instance_id,
                model_id,
            } => {
                if self.model(&instance_id).is_some() {
                    return false;
                }
                self.models.push(ModelView::new(&instance_id, &model_id));
            }
            StreamEvent::ModelChunk {
                instance_id,
                model_id,
                content,
            } => match self.live_model(&instance_id, &model_id) {
                Some(view) => view.content.push_str(&content),
                None => return false,
            },
            StreamEvent::ModelReasoning {
                instance_id,
                model_id,
                reasoning,
            } => match self.live_model(&instance_id, &model_id) {
                Some(view) => view.reasoning.push_str(&reasoning),
                None => return false,
            },
            StreamEvent::ModelComplete {
                instance_id,
                model_id,
                content,
                tokens,
                word_count,
            } => match self.live_model(&instance_id, &model_id) {
                Some(view) => {
                    view.status = ModelStatus::Complete;
                    view.content = content;
                    view.tokens = tokens;
                    view.word_count = word_count;
                }
                None => return false,
            },
            StreamEvent::ModelError {
                instance_id,
                model_id,
                error,
            } => match self.live_model(&instance_id, &model_id) {
                Some(view) => {
                    view.status = ModelStatus::Failed;
                    view.error = Some(error);
                }
                None => return false,
            },
            StreamEvent::SynthesisStart { model_id } => {
                self.synthesis.model_id = Some(model_id);
                self.synthesis.status = SynthesisStatus::Streaming;
            }
            StreamEvent::SynthesisChunk { content } => {
                if self.synthesis.status == SynthesisStatus::Complete {
                    return false;
                }
                self.synthesis.status = SynthesisStatus::Streaming;
                self.synthesis.content.push_str(&content);
            }
            StreamEvent::SynthesisComplete {
                content,
                tokens,
                word_count,
            } => {
                self.synthesis.status = SynthesisStatus::Complete;
                self.synthesis.content = content;
                self.synthesis.tokens = tokens;
                self.synthesis.word_count = word_count;
            }
            StreamEvent::Warning { warning } => self.warnings.push(warning),
            StreamEvent::Error { error } => self.error = Some(error),
            StreamEvent::DebugPrompt { content } => self.debug_prompt = Some(content),
            StreamEvent::Complete => self.done = true,
        }
        true
    }

    /// The answer to show: the synthesis when present, else the first
    /// completed model.
    pub fn final_answer(&self) -> Option<&str> {
        if self.synthesis.status == SynthesisStatus::Complete {
            return Some(&self.synthesis.content);
        }
        self.models
            .iter()
            .find(|m| m.status == ModelStatus::Complete && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }
}
