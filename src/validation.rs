use lazy_static::lazy_static;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::config::RequestLimits;
use crate::error::GatewayError;
use crate::models::{GenerationRequest, Role};
use crate::synthesis::SynthesisBudget;

lazy_static! {
    static ref MODEL_ID: Regex = Regex::new(r"^[A-Za-z0-9._:/-]{1,100}$").expect("model id pattern");
    static ref SESSION_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("session id pattern");
    static ref BLOCKED_SCHEMES: Regex =
        Regex::new(r"(?i)javascript:|vbscript:|data:text/html").expect("scheme pattern");
    static ref MARKUP: Regex = Regex::new(r"(?i)<script[^>]*>|<!--").expect("markup pattern");
}

const PLACEHOLDER_KEYS: [&str; 5] = [
    "your_api_key_here",
    "your_actual_api_key_here",
    "replace_me",
    "dummy",
    "changeme",
];
const MIN_KEY_LEN: usize = 20;
const SYNTHESIS_CHARS_RANGE: std::ops::RangeInclusive<usize> = 500..=200_000;

/// A request that passed every structural check, with budgets resolved.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub request: GenerationRequest,
    pub synthesis_model: String,
    pub budget: SynthesisBudget,
}

pub fn parse_request(body: &[u8]) -> Result<GenerationRequest, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::BadRequest(format!("invalid request body: {err}")))
}

pub fn validate(
    mut request: GenerationRequest,
    limits: &RequestLimits,
    defaults: &SynthesisBudget,
    default_model: Option<&str>,
) -> Result<ValidatedRequest, GatewayError> {
    let prompt_len = request.prompt.trim().chars().count();
    if prompt_len == 0 {
        return Err(GatewayError::BadRequest("prompt must not be empty".into()));
    }
    if prompt_len > limits.max_prompt_chars {
        return Err(GatewayError::BadRequest(format!(
            "prompt exceeds {} characters",
            limits.max_prompt_chars
        )));
    }

    request.models = request.models.iter().map(|m| m.trim().to_string()).collect();
    if request.models.is_empty() {
        return Err(GatewayError::BadRequest("at least one model is required".into()));
    }
    if request.models.len() > limits.max_models {
        return Err(GatewayError::BadRequest(format!(
            "at most {} models may be requested",
            limits.max_models
        )));
    }
    for model in &request.models {
        check_model_id(model)?;
    }
    for model in request.model_configs.keys() {
        check_model_id(model)?;
    }

    for message in &request.messages {
        if message.content.chars().count() > limits.max_prompt_chars {
            return Err(GatewayError::BadRequest(format!(
                "message exceeds {} characters",
                limits.max_prompt_chars
            )));
        }
    }
    if let Some(last) = request.messages.last() {
        if last.role != Role::User {
            return Err(GatewayError::BadRequest(
                "conversation history must end with a user message".into(),
            ));
        }
    }

    if let Some(session_id) = &request.session_id {
        if !SESSION_ID.is_match(session_id) {
            return Err(GatewayError::BadRequest("invalid session id".into()));
        }
    }

    let mut budget = defaults.clone();
    if let Some(max_chars) = request.max_synthesis_chars {
        if !SYNTHESIS_CHARS_RANGE.contains(&max_chars) {
            return Err(GatewayError::BadRequest(format!(
                "maxSynthesisChars must be between {} and {}",
                SYNTHESIS_CHARS_RANGE.start(),
                SYNTHESIS_CHARS_RANGE.end()
            )));
        }
        budget.max_chars_per_model = max_chars;
    }
    if let Some(threshold) = request.context_warning_threshold {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(GatewayError::BadRequest(
                "contextWarningThreshold must be within (0, 1]".into(),
            ));
        }
        budget.warn_threshold = threshold;
    }

    let synthesis_model = match request.refinement_model.as_deref().map(str::trim) {
        Some(model) if !model.is_empty() => {
            check_model_id(model)?;
            model.to_string()
        }
        _ => default_model
            .map(str::to_string)
            .unwrap_or_else(|| request.models[0].clone()),
    };

    Ok(ValidatedRequest {
        request,
        synthesis_model,
        budget,
    })
}

fn check_model_id(model: &str) -> Result<(), GatewayError> {
    if MODEL_ID.is_match(model) {
        Ok(())
    } else {
        Err(GatewayError::BadRequest(format!("invalid model id: {model:?}")))
    }
}

/// Content filter applied before any provider call.
pub fn check_policy(request: &GenerationRequest) -> Result<(), GatewayError> {
    let texts = std::iter::once(request.prompt.as_str())
        .chain(request.system_prompt.as_deref())
        .chain(request.messages.iter().map(|m| m.content.as_str()));
    for text in texts {
        if BLOCKED_SCHEMES.is_match(text) {
            return Err(GatewayError::PolicyRejected);
        }
        let markup: usize = MARKUP.find_iter(text).map(|m| m.as_str().len()).sum();
        if markup > 0 && markup * 5 > text.len() {
            return Err(GatewayError::PolicyRejected);
        }
    }
    Ok(())
}

/// Bearer token from the request, else the server key.
pub fn resolve_credential(
    authorization: Option<&str>,
    fallback: Option<&SecretString>,
) -> Result<SecretString, GatewayError> {
    let supplied = match authorization {
        Some(header) => {
            let token = header
                .strip_prefix("Bearer ")
                .or_else(|| header.strip_prefix("bearer "))
                .ok_or_else(|| GatewayError::Unauthorized("expected a bearer credential".into()))?;
            Some(SecretString::new(token.trim().to_string()))
        }
        None => None,
    };
    let credential = match (supplied, fallback) {
        (Some(credential), _) => credential,
        (None, Some(fallback)) => SecretString::new(fallback.expose_secret().clone()),
        (None, None) => return Err(GatewayError::Unauthorized("missing API credential".into())),
    };
    check_credential(&credential)?;
    Ok(credential)
}

fn check_credential(credential: &SecretString) -> Result<(), GatewayError> {
    let key = credential.expose_secret();
    if key.len() < MIN_KEY_LEN || key.chars().any(char::is_whitespace) {
        return Err(GatewayError::Unauthorized("malformed API credential".into()));
    }
    let lower = key.to_ascii_lowercase();
    if PLACEHOLDER_KEYS.iter().any(|p| lower.contains(p)) {
        return Err(GatewayError::Unauthorized("API credential is a placeholder".into()));
    }
    Ok(())
}

/// Rate-limit identity: a digest prefix, so raw keys never sit in the limiter.
pub fn identity_of(credential: &SecretString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.expose_secret().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..24].to_string()
}
