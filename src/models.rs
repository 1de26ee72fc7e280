use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Reasoning options forwarded to the provider for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<bool>,
}

impl ReasoningConfig {
    /// Reasoning counts as requested unless explicitly disabled.
    pub fn is_requested(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub reasoning: Option<ReasoningConfig>,
}

// Inbound request body for POST /api/generate
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_configs: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub refinement_model: Option<String>,
    #[serde(default)]
    pub max_synthesis_chars: Option<usize>,
    #[serde(default)]
    pub context_warning_threshold: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl GenerationRequest {
    /// Explicit history wins; otherwise a single user turn built from the prompt.
    pub fn conversation(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 2);
        if let Some(system) = self.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        if self.messages.is_empty() {
            messages.push(ChatMessage::user(self.prompt.clone()));
        } else {
            messages.extend(self.messages.iter().cloned());
        }
        messages
    }

    pub fn reasoning_for(&self, model_id: &str) -> Option<ReasoningConfig> {
        self.model_configs
            .get(model_id)
            .and_then(|config| config.reasoning.clone())
            .filter(ReasoningConfig::is_requested)
    }

    /// One instance per requested model, duplicates included.
    pub fn instances(&self) -> Vec<ModelInstance> {
        self.models
            .iter()
            .enumerate()
            .map(|(index, model_id)| ModelInstance::new(index, model_id))
            .collect()
    }
}

/// One running invocation of a model. Duplicates differ by `instance_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelInstance {
    pub instance_id: String,
    pub model_id: String,
}

impl ModelInstance {
    pub fn new(index: usize, model_id: &str) -> Self {
        Self {
            instance_id: format!("{model_id}#{index}"),
            model_id: model_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Final result of one instance, built by the task that streamed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutcome {
    pub instance_id: String,
    pub model_id: String,
    pub content: String,
    pub success: bool,
    pub usage: Option<Usage>,
}

impl ModelOutcome {
    pub fn failed(instance: &ModelInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            model_id: instance.model_id.clone(),
            content: String::new(),
            success: false,
            usage: None,
        }
    }

    /// Counts toward synthesis only with content and no error.
    pub fn is_usable(&self) -> bool {
        self.success && !self.content.trim().is_empty()
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
