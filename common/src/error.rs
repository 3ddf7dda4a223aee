use std::fmt;

use async_openai::error::OpenAIError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error(
        "Fallback chain exhausted for '{category}' after {} failed attempt(s)",
        errors.len()
    )]
    FallbackExhausted {
        category: String,
        errors: Vec<AttemptError>,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

/// Why a backend call failed. Drives the cooldown applied to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimit,
    Timeout,
    InvalidResponse,
    ApiError,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::InvalidResponse => "invalid_response",
            Self::ApiError => "api_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorizable failure raised by a single backend invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct ProviderError {
    pub reason: FailureReason,
    pub message: String,
}

impl ProviderError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Builds an error whose reason is inferred from the message and optional status code.
    pub fn classified(message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        let reason = classify_failure(&message, status);
        Self { reason, message }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Timeout, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(FailureReason::InvalidResponse, message)
    }
}

/// Maps a raw failure message (and HTTP status when known) onto a [`FailureReason`].
pub fn classify_failure(message: &str, status: Option<u16>) -> FailureReason {
    match status {
        Some(429) => return FailureReason::RateLimit,
        Some(408 | 504) => return FailureReason::Timeout,
        _ => {}
    }

    let lower = message.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if contains_any(&[
        "rate limit",
        "rate_limit",
        "ratelimit",
        "too many requests",
        "quota",
        "429",
        "resource exhausted",
    ]) {
        FailureReason::RateLimit
    } else if contains_any(&["timeout", "timed out", "deadline", "time out"]) {
        FailureReason::Timeout
    } else if contains_any(&[
        "invalid response",
        "invalid_response",
        "parse",
        "json",
        "empty response",
        "no content",
        "malformed",
    ]) {
        FailureReason::InvalidResponse
    } else {
        FailureReason::ApiError
    }
}

impl From<OpenAIError> for ProviderError {
    fn from(err: OpenAIError) -> Self {
        Self::from(&err)
    }
}

impl From<&OpenAIError> for ProviderError {
    fn from(err: &OpenAIError) -> Self {
        match err {
            OpenAIError::Reqwest(inner) if inner.is_timeout() => Self::timeout(err.to_string()),
            OpenAIError::Reqwest(inner) => {
                let status = inner.status().map(|status| status.as_u16());
                Self::classified(err.to_string(), status)
            }
            OpenAIError::JSONDeserialize(..) => Self::invalid_response(err.to_string()),
            _ => Self::classified(err.to_string(), None),
        }
    }
}

/// One failed attempt recorded while walking a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub provider_id: String,
    pub reason: FailureReason,
    pub message: String,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.provider_id, self.reason, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes_before_messages() {
        assert_eq!(
            classify_failure("anything", Some(429)),
            FailureReason::RateLimit
        );
        assert_eq!(classify_failure("gateway", Some(504)), FailureReason::Timeout);
        assert_eq!(classify_failure("boom", Some(500)), FailureReason::ApiError);
    }

    #[test]
    fn classifies_messages() {
        assert_eq!(
            classify_failure("Rate limit reached for requests", None),
            FailureReason::RateLimit
        );
        assert_eq!(
            classify_failure("You exceeded your current quota", None),
            FailureReason::RateLimit
        );
        assert_eq!(
            classify_failure("request timed out after 30s", None),
            FailureReason::Timeout
        );
        assert_eq!(
            classify_failure("failed to parse JSON body", None),
            FailureReason::InvalidResponse
        );
        assert_eq!(
            classify_failure("internal server error", None),
            FailureReason::ApiError
        );
    }

    #[test]
    fn openai_errors_are_classified_by_message() {
        let err = OpenAIError::InvalidArgument("response body was not valid JSON".into());
        assert_eq!(
            ProviderError::from(err).reason,
            FailureReason::InvalidResponse
        );
    }

    #[test]
    fn exhausted_error_reports_attempt_count() {
        let err = AppError::FallbackExhausted {
            category: "generation".into(),
            errors: vec![
                AttemptError {
                    provider_id: "a".into(),
                    reason: FailureReason::Timeout,
                    message: "slow".into(),
                },
                AttemptError {
                    provider_id: "b".into(),
                    reason: FailureReason::ApiError,
                    message: "down".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Fallback chain exhausted for 'generation' after 2 failed attempt(s)"
        );
    }
}
