//! Language-model extraction behind a circuit breaker, with a timeout and a retry budget.

mod breaker;
mod client;
mod prompt;
mod protected;
mod repair;
mod schema;

use std::time::Duration;

use thiserror::Error;
use tutorfeed_core::FailureKind;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreaker};
pub use client::{
    classify_reqwest_error, classify_status, content_from_body, ChatMessage, CompletionBackend,
    LlmClientConfig, OpenAiCompatClient, RetryDisposition, ScriptedBackend,
};
pub use prompt::{build_messages, FewShot, FEW_SHOTS, PROMPT_VERSION, SYSTEM_PROMPT};
pub use protected::{Extraction, ExtractionReport, ExtractorSettings, ProtectedExtractor};
pub use repair::{parse_lenient, repair_json, strip_code_blocks};
pub use schema::ModelExtraction;

pub const CRATE_NAME: &str = "tutorfeed-extract";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractError {
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {message}")]
    Transport {
        message: String,
        disposition: RetryDisposition,
    },
    #[error("unparseable model output: {0}")]
    Parse(String),
    #[error("circuit breaker open, next trial in {0:?}")]
    BreakerOpen(Duration),
    #[error("model returned no content")]
    Empty,
}

impl ExtractError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractError::Timeout(_) => FailureKind::Timeout,
            ExtractError::Http { .. } => FailureKind::HttpError,
            ExtractError::Transport { .. } => FailureKind::Transport,
            ExtractError::Parse(_) | ExtractError::Empty => FailureKind::ParseError,
            ExtractError::BreakerOpen(_) => FailureKind::BreakerOpen,
        }
    }

    /// Short machine-readable code stored on the failed job.
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::Timeout(_) => "extract_timeout",
            ExtractError::Http { .. } => "extract_http_error",
            ExtractError::Transport { .. } => "extract_transport",
            ExtractError::Parse(_) => "extract_parse_error",
            ExtractError::BreakerOpen(_) => "breaker_open",
            ExtractError::Empty => "extract_empty",
        }
    }

    /// Whether the in-job retry budget may be spent on this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractError::Timeout(_) => true,
            ExtractError::Http { status, .. } => {
                reqwest::StatusCode::from_u16(*status)
                    .map(|s| classify_status(s) == RetryDisposition::Retryable)
                    .unwrap_or(false)
            }
            ExtractError::Transport { disposition, .. } => {
                *disposition == RetryDisposition::Retryable
            }
            ExtractError::Parse(_) | ExtractError::BreakerOpen(_) | ExtractError::Empty => false,
        }
    }

    /// Failures that say the service itself is unhealthy. A reply that fails to parse
    /// still means the service answered.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ExtractError::Timeout(_) | ExtractError::Http { .. } | ExtractError::Transport { .. }
        )
    }
}
