use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use tutorfeed_core::{BackoffPolicy, FailureKind};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::client::CompletionBackend;
use crate::prompt::{build_messages, PROMPT_VERSION};
use crate::repair::parse_lenient;
use crate::schema::ModelExtraction;
use crate::ExtractError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractorSettings {
    /// Upper bound on one model call, including reading the reply.
    pub timeout: Duration,
    /// `max_retries` is the in-job retry budget for timeouts and transient HTTP errors.
    pub retry: BackoffPolicy,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            retry: BackoffPolicy::new(1, Duration::from_secs(2), Duration::from_secs(10)),
        }
    }
}

/// What happened during one `extract` call, kept with the job result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionReport {
    pub model: String,
    pub prompt_version: &'static str,
    pub latency_ms: u64,
    pub attempts: u32,
    pub failure_kind: Option<FailureKind>,
    pub repaired: bool,
}

impl ExtractionReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub result: Result<ModelExtraction, ExtractError>,
    pub report: ExtractionReport,
}

/// Model extraction guarded by a circuit breaker, a per-call timeout and a retry budget.
pub struct ProtectedExtractor {
    backend: Arc<dyn CompletionBackend>,
    breaker: Arc<CircuitBreaker>,
    settings: ExtractorSettings,
}

impl ProtectedExtractor {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        breaker: BreakerConfig,
        settings: ExtractorSettings,
    ) -> Self {
        Self::with_breaker(backend, Arc::new(CircuitBreaker::new(breaker)), settings)
    }

    pub fn with_breaker(
        backend: Arc<dyn CompletionBackend>,
        breaker: Arc<CircuitBreaker>,
        settings: ExtractorSettings,
    ) -> Self {
        Self {
            backend,
            breaker,
            settings,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn call_once(&self, messages: &[crate::ChatMessage]) -> Result<String, ExtractError> {
        self.breaker
            .call(|| async {
                match tokio::time::timeout(self.settings.timeout, self.backend.complete(messages))
                    .await
                {
                    Ok(reply) => reply,
                    Err(_) => Err(ExtractError::Timeout(self.settings.timeout)),
                }
            })
            .await
    }

    /// Never returns an error directly; the outcome and its report are always produced
    /// so the caller can complete the job cleanly.
    pub async fn extract(&self, text: &str) -> Extraction {
        let started = Instant::now();
        let messages = build_messages(text);
        let max_retries = self.settings.retry.max_retries;

        let mut attempts = 0u32;
        let mut repaired = false;
        let mut result: Result<ModelExtraction, ExtractError> = Err(ExtractError::Empty);

        for attempt in 0..=max_retries {
            attempts += 1;
            result = match self.call_once(&messages).await {
                Ok(raw) => match parse_lenient(&raw) {
                    Ok((value, was_repaired)) => {
                        repaired = was_repaired;
                        ModelExtraction::from_value(&value)
                    }
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };

            match &result {
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    warn!(
                        error = %err,
                        failure_kind = %err.kind(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "extraction attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => break,
            }
        }

        let report = ExtractionReport {
            model: self.backend.model().to_string(),
            prompt_version: PROMPT_VERSION,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
            failure_kind: result.as_ref().err().map(ExtractError::kind),
            repaired,
        };
        match &result {
            Ok(_) => debug!(latency_ms = report.latency_ms, attempts, repaired, "extraction succeeded"),
            Err(err) => warn!(
                error = %err,
                failure_kind = %err.kind(),
                latency_ms = report.latency_ms,
                attempts,
                "extraction failed"
            ),
        }
        Extraction { result, report }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::client::ScriptedBackend;

    const REPLY: &str = r#"{"is_assignment": true, "subjects": ["Maths"], "level": "Primary"}"#;

    fn extractor(backend: Arc<ScriptedBackend>, threshold: u32) -> ProtectedExtractor {
        ProtectedExtractor::new(
            backend,
            BreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(120),
            },
            ExtractorSettings {
                timeout: Duration::from_secs(5),
                retry: BackoffPolicy::new(1, Duration::from_secs(1), Duration::from_secs(4)),
            },
        )
    }

    fn http(status: u16) -> ExtractError {
        ExtractError::Http {
            status,
            body: "upstream".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_within_budget() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(Err(http(503)));
        backend.push(Ok(REPLY.to_string()));
        let extraction = extractor(backend.clone(), 5).extract("P5 Maths").await;

        let parsed = extraction.result.unwrap();
        assert_eq!(parsed.subjects, vec!["Maths"]);
        assert_eq!(extraction.report.attempts, 2);
        assert_eq!(extraction.report.failure_kind, None);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_and_parse_errors_are_not_retried() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(Err(http(401)));
        let extraction = extractor(backend.clone(), 5).extract("P5 Maths").await;
        assert_eq!(extraction.report.failure_kind, Some(FailureKind::HttpError));
        assert_eq!(backend.calls(), 1);

        backend.push(Ok("no json here".to_string()));
        let extraction = extractor(backend.clone(), 5).extract("P5 Maths").await;
        assert_eq!(extraction.report.failure_kind, Some(FailureKind::ParseError));
        assert_eq!(extraction.report.attempts, 1);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_on_every_attempt() {
        let backend = Arc::new(ScriptedBackend::responding(|_| Ok(REPLY.to_string())).with_delay(Duration::from_secs(30)));
        let extraction = extractor(backend.clone(), 5).extract("P5 Maths").await;
        assert!(matches!(extraction.result, Err(ExtractError::Timeout(_))));
        assert_eq!(extraction.report.failure_kind, Some(FailureKind::Timeout));
        assert_eq!(extraction.report.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_calling_backend() {
        let backend = Arc::new(ScriptedBackend::responding(|_| Err(http(502))));
        let extractor = extractor(backend.clone(), 2);

        let first = extractor.extract("P5 Maths").await;
        assert_eq!(first.report.failure_kind, Some(FailureKind::HttpError));
        assert_eq!(extractor.breaker().state(), BreakerState::Open);
        assert_eq!(backend.calls(), 2);

        let second = extractor.extract("P5 Maths").await;
        assert_eq!(second.report.failure_kind, Some(FailureKind::BreakerOpen));
        assert_eq!(second.report.attempts, 1);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repaired_output_is_reported() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(Ok("```json\n{\"subjects\": [\"Physics\"],}\n```".to_string()));
        let extraction = extractor(backend, 5).extract("Sec 4 Physics").await;
        assert!(extraction.report.repaired);
        assert_eq!(extraction.result.unwrap().subjects, vec!["Physics"]);
        assert_eq!(extraction.report.to_json()["prompt_version"], PROMPT_VERSION);
    }
}
