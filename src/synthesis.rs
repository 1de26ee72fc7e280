use std::borrow::Cow;

use crate::models::ModelOutcome;

pub const TRUNCATION_MARKER: &str = "\n\n[... response truncated ...]";

// Tokens taken by the fixed template text around the drafts
const TEMPLATE_OVERHEAD_TOKENS: usize = 250;

const PREAMBLE: &str = "You are an expert assistant. Several independent drafts answering the \
same request are shown below. Use them to write the single best answer to the original request.";

const INSTRUCTIONS: &str = "Instructions:\n\
- Combine the strongest, most accurate points from the drafts and resolve any disagreements.\n\
- Answer directly in a single voice, as if you wrote the answer from scratch.\n\
- Never mention drafts, responses, sources, or that more than one author was involved.";

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisBudget {
    pub max_chars_per_model: usize,
    pub context_limit: usize,
    pub response_reserve: usize,
    /// Fraction of the usable budget that triggers a soft warning.
    pub warn_threshold: f64,
}

impl Default for SynthesisBudget {
    fn default() -> Self {
        Self {
            max_chars_per_model: 12_000,
            context_limit: 128_000,
            response_reserve: 4096,
            warn_threshold: 0.8,
        }
    }
}

impl SynthesisBudget {
    pub fn usable_tokens(&self) -> usize {
        self.context_limit.saturating_sub(self.response_reserve)
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub prompt: String,
    pub estimated_tokens: usize,
    /// False when the estimate exceeds the usable budget. Synthesis still runs.
    pub within_limit: bool,
    pub truncated_models: Vec<String>,
    pub warnings: Vec<String>,
}

impl SynthesisContext {
    pub fn warning(&self) -> Option<String> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(self.warnings.join(" "))
        }
    }
}

/// Deliberately pessimistic: the larger of the word and character estimates,
/// plus half a token for every symbol.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count() as f64;
    let chars = text.chars().count() as f64;
    let symbols = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && *c != '_' && !c.is_whitespace())
        .count() as f64;
    (f64::max(words * 1.3, chars / 4.0) + symbols * 0.5).ceil() as usize
}

/// Cuts `content` to `max_chars` characters and appends the marker.
pub fn truncate(content: &str, max_chars: usize) -> (Cow<'_, str>, bool) {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut clipped = String::with_capacity(cut + TRUNCATION_MARKER.len());
            clipped.push_str(&content[..cut]);
            clipped.push_str(TRUNCATION_MARKER);
            (Cow::Owned(clipped), true)
        }
        None => (Cow::Borrowed(content), false),
    }
}

pub fn build(user_prompt: &str, outcomes: &[ModelOutcome], budget: &SynthesisBudget) -> SynthesisContext {
    let mut truncated_models = Vec::new();
    let mut drafts = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let (draft, was_truncated) = truncate(&outcome.content, budget.max_chars_per_model);
        if was_truncated && !truncated_models.contains(&outcome.model_id) {
            truncated_models.push(outcome.model_id.clone());
        }
        drafts.push(draft);
    }

    let estimated_tokens = estimate_tokens(user_prompt)
        + drafts.iter().map(|d| estimate_tokens(d)).sum::<usize>()
        + TEMPLATE_OVERHEAD_TOKENS;

    let mut prompt = String::new();
    prompt.push_str(PREAMBLE);
    prompt.push_str("\n\nOriginal request:\n");
    prompt.push_str(user_prompt);
    for (index, draft) in drafts.iter().enumerate() {
        prompt.push_str(&format!("\n\nDraft {}:\n", index + 1));
        prompt.push_str(draft);
    }
    prompt.push_str("\n\n");
    prompt.push_str(INSTRUCTIONS);

    let mut warnings = Vec::new();
    if !truncated_models.is_empty() {
        warnings.push(format!(
            "Long responses from {} were truncated to {} characters before synthesis.",
            truncated_models.join(", "),
            budget.max_chars_per_model
        ));
    }

    let usable = budget.usable_tokens();
    let within_limit = estimated_tokens <= usable;
    if !within_limit {
        warnings.push(format!(
            "Synthesis input (~{estimated_tokens} tokens) likely exceeds the model limit of \
             {usable} tokens; the final answer may be incomplete."
        ));
    } else if (estimated_tokens as f64) > budget.warn_threshold * usable as f64 {
        let percent = (estimated_tokens as f64 / usable as f64 * 100.0).round();
        warnings.push(format!(
            "Synthesis input is at {percent}% of the available context."
        ));
    }

    SynthesisContext {
        prompt,
        estimated_tokens,
        within_limit,
        truncated_models,
        warnings,
    }
}
