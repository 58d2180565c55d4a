use crate::types::TurnStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// LLM failure kinds with fixed retryability defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    RateLimit,
    AuthError,
    QuotaExceeded,
    ModelError,
    Timeout,
    NetworkError,
    InvalidResponse,
}

impl LlmErrorKind {
    pub fn default_retryable(&self) -> bool {
        match self {
            Self::RateLimit | Self::Timeout | Self::NetworkError | Self::ModelError => true,
            Self::AuthError | Self::QuotaExceeded => false,
            Self::InvalidResponse => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ModelError => "model_error",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

impl From<LlmErrorKind> for TurnStatus {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::RateLimit => TurnStatus::RateLimit,
            LlmErrorKind::AuthError => TurnStatus::AuthError,
            LlmErrorKind::QuotaExceeded => TurnStatus::QuotaExceeded,
            LlmErrorKind::ModelError => TurnStatus::ModelError,
            LlmErrorKind::Timeout => TurnStatus::Timeout,
            LlmErrorKind::NetworkError => TurnStatus::NetworkError,
            LlmErrorKind::InvalidResponse => TurnStatus::InvalidResponse,
        }
    }
}

impl TryFrom<TurnStatus> for LlmErrorKind {
    type Error = ();

    fn try_from(status: TurnStatus) -> Result<Self, ()> {
        match status {
            TurnStatus::Success => Err(()),
            TurnStatus::RateLimit => Ok(Self::RateLimit),
            TurnStatus::AuthError => Ok(Self::AuthError),
            TurnStatus::QuotaExceeded => Ok(Self::QuotaExceeded),
            TurnStatus::ModelError => Ok(Self::ModelError),
            TurnStatus::Timeout => Ok(Self::Timeout),
            TurnStatus::NetworkError => Ok(Self::NetworkError),
            TurnStatus::InvalidResponse => Ok(Self::InvalidResponse),
        }
    }
}

/// Error returned by a provider's `execute_turn`.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("{} error: {message}", kind.as_str())]
pub struct ProviderError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub error_name: Option<String>,
    pub error_code: Option<String>,
}

impl ProviderError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            error_name: None,
            error_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Kind-level default, overridden for model errors whose signature marks
    /// them permanently unservable (unknown/unsupported model).
    pub fn is_retryable(&self) -> bool {
        if self.kind == LlmErrorKind::ModelError && self.matches_non_retryable_model_pattern() {
            return false;
        }
        self.kind.default_retryable()
    }

    fn matches_non_retryable_model_pattern(&self) -> bool {
        if let Some(code) = self.error_code.as_deref() {
            if NON_RETRYABLE_MODEL_CODES.contains(&code) {
                return true;
            }
        }
        let message = self.message.to_ascii_lowercase();
        NON_RETRYABLE_MODEL_SUBSTRINGS
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}

const NON_RETRYABLE_MODEL_CODES: &[&str] = &["model_not_found", "model_not_supported"];

const NON_RETRYABLE_MODEL_SUBSTRINGS: &[&str] = &[
    "model_not_found",
    "unsupported model",
    "unknown model",
    "does not exist",
    "has been deprecated",
];

/// Classify a raw provider failure into a kind. Signals are consulted in
/// priority order: HTTP status, error name, error code, message substrings.
pub fn classify_provider_failure(
    status_code: Option<u16>,
    error_name: Option<&str>,
    error_code: Option<&str>,
    message: &str,
) -> LlmErrorKind {
    if let Some(status) = status_code {
        match status {
            429 => return LlmErrorKind::RateLimit,
            401 | 403 => return LlmErrorKind::AuthError,
            402 => return LlmErrorKind::QuotaExceeded,
            408 | 504 => return LlmErrorKind::Timeout,
            500..=599 => return LlmErrorKind::ModelError,
            _ => {}
        }
    }

    if let Some(name) = error_name {
        let name = name.to_ascii_lowercase();
        if name.contains("timeout") || name.contains("abort") {
            return LlmErrorKind::Timeout;
        }
        if name.contains("fetch") || name.contains("network") || name.contains("connection") {
            return LlmErrorKind::NetworkError;
        }
    }

    if let Some(code) = error_code {
        match code {
            "rate_limit_exceeded" | "overloaded_error" | "RESOURCE_EXHAUSTED" => {
                return LlmErrorKind::RateLimit;
            }
            "insufficient_quota" | "billing_hard_limit_reached" => {
                return LlmErrorKind::QuotaExceeded;
            }
            "invalid_api_key" | "authentication_error" | "PERMISSION_DENIED" => {
                return LlmErrorKind::AuthError;
            }
            "model_not_found" | "model_not_supported" => return LlmErrorKind::ModelError,
            "ETIMEDOUT" => return LlmErrorKind::Timeout,
            "ECONNRESET" | "ECONNREFUSED" | "ENOTFOUND" | "EAI_AGAIN" => {
                return LlmErrorKind::NetworkError;
            }
            _ => {}
        }
    }

    let message = message.to_ascii_lowercase();
    if message.contains("rate limit") || message.contains("too many requests") {
        return LlmErrorKind::RateLimit;
    }
    if message.contains("quota") || message.contains("billing") {
        return LlmErrorKind::QuotaExceeded;
    }
    if message.contains("unauthorized")
        || message.contains("api key")
        || message.contains("forbidden")
    {
        return LlmErrorKind::AuthError;
    }
    if message.contains("timed out") || message.contains("timeout") {
        return LlmErrorKind::Timeout;
    }
    if message.contains("network") || message.contains("connection") || message.contains("socket")
    {
        return LlmErrorKind::NetworkError;
    }
    LlmErrorKind::ModelError
}

/// Classify and build a `ProviderError` in one step, keeping the raw signals
/// for the retryability override.
pub fn provider_error_from_parts(
    status_code: Option<u16>,
    error_name: Option<&str>,
    error_code: Option<&str>,
    message: impl Into<String>,
) -> ProviderError {
    let message = message.into();
    let kind = classify_provider_failure(status_code, error_name, error_code, &message);
    ProviderError {
        kind,
        message,
        status_code,
        error_name: error_name.map(str::to_string),
        error_code: error_code.map(str::to_string),
    }
}
