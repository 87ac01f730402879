use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ExtractError;

/// Longest error body kept on an `Http` failure.
const MAX_ERROR_BODY_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// One chat-completion round trip returning the assistant's raw text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// Base URL of an OpenAI-compatible API, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub temperature: f32,
    /// Ask the server for `response_format: json_object`.
    pub json_mode: bool,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
            temperature: 0.0,
            json_mode: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the first choice's content out of a chat-completions response body.
pub fn content_from_body(body: &str) -> Result<String, ExtractError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|err| ExtractError::Parse(format!("chat response envelope: {err}")))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(ExtractError::Empty)
}

fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: LlmClientConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .context("api key is not a valid header value")?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self { http, config })
    }

    fn transport_error(&self, err: reqwest::Error) -> ExtractError {
        if err.is_timeout() {
            return ExtractError::Timeout(self.config.request_timeout);
        }
        ExtractError::Transport {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            response_format: self.config.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %self.config.model, messages = messages.len(), "chat completion request");

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;

        if !status.is_success() {
            return Err(ExtractError::Http {
                status: status.as_u16(),
                body: truncate_to_char_boundary(&body, MAX_ERROR_BODY_BYTES).to_string(),
            });
        }

        content_from_body(&body)
    }
}

type Responder = dyn Fn(&str) -> Result<String, ExtractError> + Send + Sync;

/// Backend that replays canned replies instead of calling a service, for tests and
/// offline runs. Queued replies are used first, then the responder, if any.
pub struct ScriptedBackend {
    queued: Mutex<VecDeque<Result<String, ExtractError>>>,
    responder: Option<Box<Responder>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            responder: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every call by looking at the post text.
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, ExtractError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, reply: Result<String, ExtractError>) {
        self.queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(reply) = queued {
            return reply;
        }
        let post = messages.last().map_or("", |m| m.content.as_str());
        match &self.responder {
            Some(responder) => responder(post),
            None => Err(ExtractError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_follow_server_and_rate_limit_errors() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn content_is_taken_from_first_choice() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"{\"subjects\":[]}"}}]}"#;
        assert_eq!(content_from_body(body).unwrap(), r#"{"subjects":[]}"#);
    }

    #[test]
    fn blank_or_missing_content_is_empty() {
        assert_eq!(
            content_from_body(r#"{"choices":[{"message":{"content":"  "}}]}"#),
            Err(ExtractError::Empty)
        );
        assert_eq!(content_from_body(r#"{"choices":[]}"#), Err(ExtractError::Empty));
        assert!(matches!(
            content_from_body("<html>bad gateway</html>"),
            Err(ExtractError::Parse(_))
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "error 世界";
        let cut = truncate_to_char_boundary(text, 8);
        assert!(cut.len() <= 8);
        assert!(text.starts_with(cut));
    }

    #[test]
    fn client_builds_with_bearer_key() {
        let client = OpenAiCompatClient::new(LlmClientConfig {
            api_key: Some("sk-test".into()),
            ..LlmClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.model(), "gpt-4o-mini");
    }
}
