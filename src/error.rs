use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::config::Environment;

/// Rejections raised before the event stream opens. Each maps to one HTTP status.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("request rejected by content policy")]
    PolicyRejected,
    #[error("a generation is already in progress for this session")]
    SessionBusy,
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::PolicyRejected => StatusCode::FORBIDDEN,
            GatewayError::SessionBusy => StatusCode::CONFLICT,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, also used as the rejection metric label.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::PolicyRejected => "policy_rejected",
            GatewayError::SessionBusy => "generation_in_progress",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = match &self {
            GatewayError::Internal(detail) => {
                tracing::error!(detail = %sanitize(detail), "request failed");
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: message,
            code: self.code(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Failure classes for a single provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    BadRequest,
    RateLimited,
    NotFound,
    ContentPolicy,
    ProviderUnavailable,
    Timeout,
    Cancelled,
    CapabilityUnsupported,
    Unknown,
}

impl ErrorKind {
    /// Only transient upstream conditions are retried inside a stream.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ProviderUnavailable | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ContentPolicy => "content_policy",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CapabilityUnsupported => "capability_unsupported",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::Auth => "Authentication with the model provider failed",
            ErrorKind::BadRequest => "The model provider rejected the request",
            ErrorKind::RateLimited => "The model provider is rate limiting requests, try again later",
            ErrorKind::NotFound => "The requested model was not found",
            ErrorKind::ContentPolicy => "The request was rejected by the provider's content policy",
            ErrorKind::ProviderUnavailable => "The model provider is temporarily unavailable",
            ErrorKind::Timeout => "The model stopped responding",
            ErrorKind::Cancelled => "Request cancelled",
            ErrorKind::CapabilityUnsupported => "The model does not support the requested options",
            ErrorKind::Unknown => "An unexpected error occurred",
        }
    }

    /// Maps an upstream HTTP status (and its message) onto the taxonomy.
    pub fn from_status(status: u16, message: &str) -> Self {
        match status {
            401 | 402 => ErrorKind::Auth,
            403 => ErrorKind::ContentPolicy,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            400 | 413 | 422 if mentions_unsupported_reasoning(message) => {
                ErrorKind::CapabilityUnsupported
            }
            400 | 413 | 422 => ErrorKind::BadRequest,
            500..=599 => ErrorKind::ProviderUnavailable,
            _ if mentions_unsupported_reasoning(message) => ErrorKind::CapabilityUnsupported,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn mentions_unsupported_reasoning(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("reasoning")
        && (lower.contains("not supported")
            || lower.contains("unsupported")
            || lower.contains("does not support")
            || lower.contains("not available"))
}

/// A classified provider failure. `message` is raw upstream text and must go
/// through [`ProviderError::safe_message`] before reaching a client.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::from_status(status, &message),
            status: Some(status),
            message,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn safe_message(&self, environment: Environment) -> String {
        match environment {
            Environment::Production => self.kind.user_message().to_string(),
            Environment::Development => {
                format!("{} ({})", self.kind.user_message(), sanitize(&self.message))
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            ErrorKind::ProviderUnavailable
        } else {
            ErrorKind::Unknown
        };
        Self {
            kind,
            status: err.status().map(|s| s.as_u16()),
            message: err.without_url().to_string(),
        }
    }
}

/// Backing-store failures for the limiter and the session lock.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

lazy_static! {
    static ref SENSITIVE_PATTERNS: Vec<Regex> = [
        r"sk-[A-Za-z0-9_-]{6,}",
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+",
        r#"(?i)(password|token|secret|api[_-]?key)["\s]*[:=]["\s]*[^\s"]+"#,
        r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("sensitive pattern compiles"))
    .collect();
}

/// Redacts credentials and personal data from free-form error text.
pub fn sanitize(message: &str) -> String {
    SENSITIVE_PATTERNS
        .iter()
        .fold(message.to_string(), |acc, pattern| {
            pattern.replace_all(&acc, "[REDACTED]").into_owned()
        })
}
