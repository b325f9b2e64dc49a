//! Failure classification for the outer retry layer.
//!
//! `classify` is a pure function over a [`FailureInfo`] — the explicit
//! `{message, status, code}` union captured once at the boundary where an
//! error is first caught. Identical input shapes always yield identical
//! classifications; the decision order below is first-match-wins.

use opsdesk_core::error::ProviderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable reason codes consumed by the retry layer and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    AuthError,
    BadRequest,
    NotFound,
    ContentPolicy,
    InvalidModel,
    ContextLengthExceeded,
    RateLimit,
    ServerError,
    NetworkError,
    Timeout,
    Overloaded,
    Unknown,
}

impl ReasonCode {
    /// The stable string form (matches the serialized representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthError => "auth_error",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::ContentPolicy => "content_policy",
            Self::InvalidModel => "invalid_model",
            Self::ContextLengthExceeded => "context_length_exceeded",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::Overloaded => "overloaded",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verdict for one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub should_retry: bool,
    pub reason: ReasonCode,
    pub description: String,
}

/// The explicit error shape captured at the catch boundary.
///
/// Replaces the duck-typed error objects of ad-hoc provider SDKs with a
/// tagged union decided once, where the error is first caught.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Human-readable error message.
    pub message: String,

    /// HTTP status, when the failure came from an API response.
    pub status: Option<u16>,

    /// Transport-level error code (e.g. "ECONNRESET"), when present.
    pub code: Option<String>,
}

impl FailureInfo {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<&ProviderError> for FailureInfo {
    fn from(err: &ProviderError) -> Self {
        let message = err.to_string();
        match err {
            ProviderError::ApiError { status_code, .. } => {
                Self::from_message(message).with_status(*status_code)
            }
            ProviderError::RateLimited { .. } => Self::from_message(message).with_status(429),
            ProviderError::AuthenticationFailed(_) => Self::from_message(message).with_status(401),
            ProviderError::ModelNotFound(_)
            | ProviderError::ContentPolicy(_)
            | ProviderError::ContextLengthExceeded(_)
            | ProviderError::StreamInterrupted(_)
            | ProviderError::NotConfigured(_)
            | ProviderError::Timeout(_)
            | ProviderError::Network(_) => Self::from_message(message),
        }
    }
}

const NETWORK_CODES: [&str; 6] = [
    "ECONNRESET",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EPIPE",
    "EAI_AGAIN",
    "ETIMEDOUT",
];

const NETWORK_PHRASES: [&str; 4] = [
    "socket hang up",
    "connection reset",
    "connection refused",
    "network error",
];

/// Map a failure into the retry taxonomy. First match wins.
pub fn classify(info: &FailureInfo) -> ErrorClassification {
    let msg = info.message.to_lowercase();
    let status = info.status;

    let (should_retry, reason) = if matches!(status, Some(401) | Some(403)) {
        (false, ReasonCode::AuthError)
    } else if status == Some(400) {
        (false, ReasonCode::BadRequest)
    } else if status == Some(404) {
        (false, ReasonCode::NotFound)
    } else if msg.contains("content policy") || msg.contains("content_policy") {
        (false, ReasonCode::ContentPolicy)
    } else if msg.contains("model not found")
        || msg.contains("unknown model")
        || msg.contains("invalid model")
    {
        (false, ReasonCode::InvalidModel)
    } else if msg.contains("context length")
        || msg.contains("context_length_exceeded")
        || msg.contains("maximum context")
    {
        // A retry would hit the same ceiling; this needs summarization.
        (false, ReasonCode::ContextLengthExceeded)
    } else if status == Some(429) || msg.contains("rate limit") || msg.contains("rate_limit") {
        (true, ReasonCode::RateLimit)
    } else if matches!(status, Some(s) if (500..600).contains(&s)) {
        (true, ReasonCode::ServerError)
    } else if is_network_failure(info, &msg) {
        (true, ReasonCode::NetworkError)
    } else if msg.contains("timeout") || msg.contains("timed out") {
        (true, ReasonCode::Timeout)
    } else if msg.contains("overloaded") || msg.contains("capacity") {
        (true, ReasonCode::Overloaded)
    } else {
        // Conservative default: retry what we cannot name.
        (true, ReasonCode::Unknown)
    };

    ErrorClassification {
        should_retry,
        reason,
        description: info.message.clone(),
    }
}

fn is_network_failure(info: &FailureInfo, lower_msg: &str) -> bool {
    if let Some(code) = &info.code {
        if NETWORK_CODES.iter().any(|c| code.eq_ignore_ascii_case(c)) {
            return true;
        }
    }
    NETWORK_PHRASES.iter().any(|p| lower_msg.contains(p))
}

/// A non-retryable failure, wrapped so an outer retrier can short-circuit
/// without re-running `classify` on every attempt.
#[derive(Debug, Error)]
#[error("{reason}: {source}")]
pub struct NonRetryableError {
    /// Why retrying would not help.
    pub reason: ReasonCode,

    /// The original cause, untouched.
    #[source]
    pub source: opsdesk_core::Error,
}

impl NonRetryableError {
    pub fn new(reason: ReasonCode, source: opsdesk_core::Error) -> Self {
        Self { reason, source }
    }
}
