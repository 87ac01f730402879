use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tutorfeed_core::{
    BackoffPolicy, CompleteResult, ExtractionJob, FailureKind, JobFailure, JobOutcome, JobStatus,
    RawMessage, SkipReason,
};
use tutorfeed_extract::{CompletionBackend, ProtectedExtractor};
use tutorfeed_signals::{SignalBuilder, Taxonomy};
use tutorfeed_storage::{content_hash, PersistOutcome};

use crate::bump::Bumper;
use crate::compose::Composer;
use crate::config::PipelineConfig;
use crate::dedup::DuplicateDetector;
use crate::persist::{NoopPersistHook, PersistHook, Persister};
use crate::router::{route, RouteDecision};
use crate::tasks::BackgroundTasks;
use crate::validate::Validator;
use crate::Stores;

/// Longest pause between claim attempts while the queue store is failing.
const MAX_CLAIM_BACKOFF: Duration = Duration::from_secs(60);

/// Counts for one batch, or for the lifetime of `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub claimed: usize,
    pub ok: usize,
    pub skipped: usize,
    /// Terminal failures.
    pub failed: usize,
    /// Failures sent back to pending with backoff.
    pub retried: usize,
    /// Completions discarded because the job was re-queued or reclaimed meanwhile.
    pub stale: usize,
    /// Completions that could not be written; the job is reclaimed once stale.
    pub errors: usize,
}

impl RunSummary {
    fn record(&mut self, completion: Option<CompleteResult>) {
        match completion {
            Some(CompleteResult::Applied(JobStatus::Ok)) => self.ok += 1,
            Some(CompleteResult::Applied(JobStatus::Skipped)) => self.skipped += 1,
            Some(CompleteResult::Applied(JobStatus::Failed)) => self.failed += 1,
            Some(CompleteResult::Applied(JobStatus::Pending | JobStatus::Processing)) => {
                self.retried += 1
            }
            Some(CompleteResult::Stale) => self.stale += 1,
            None => self.errors += 1,
        }
    }

    fn absorb(&mut self, other: RunSummary) {
        self.claimed += other.claimed;
        self.ok += other.ok;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.retried += other.retried;
        self.stale += other.stale;
        self.errors += other.errors;
    }
}

fn finish(outcome: JobOutcome, meta: Map<String, Value>) -> JobOutcome {
    outcome.with_meta(Value::Object(meta))
}

fn storage_failure(code: &str, err: &anyhow::Error) -> JobOutcome {
    JobOutcome::failed(JobFailure::new(FailureKind::Storage, code, format!("{err:#}")))
}

/// Claims jobs and drives each through route, extract, compose, validate and persist.
pub struct Worker {
    config: Arc<PipelineConfig>,
    stores: Stores,
    extractor: Arc<ProtectedExtractor>,
    signals: SignalBuilder,
    composer: Composer,
    validator: Validator,
    persister: Persister,
    bumper: Bumper,
    detector: Arc<DuplicateDetector>,
    hook: Arc<dyn PersistHook>,
    tasks: BackgroundTasks,
}

impl Worker {
    pub fn new(
        config: PipelineConfig,
        stores: Stores,
        backend: Arc<dyn CompletionBackend>,
        taxonomy: Arc<Taxonomy>,
    ) -> Result<Self> {
        let extractor = Arc::new(ProtectedExtractor::new(
            backend,
            config.breaker_config(),
            config.extractor_settings(),
        ));
        let signals = SignalBuilder::new(taxonomy.clone()).context("building signal parsers")?;
        let detector = Arc::new(DuplicateDetector::new(
            stores.assignments.clone(),
            stores.duplicates.clone(),
            config.dedup_config(),
            config.channel_quality.clone(),
        ));
        Ok(Self {
            composer: Composer::new(taxonomy),
            validator: Validator::new(config.validation_mode),
            persister: Persister::new(stores.assignments.clone()),
            bumper: Bumper::new(
                stores.raw.clone(),
                stores.assignments.clone(),
                config.min_bump_interval(),
            ),
            config: Arc::new(config),
            stores,
            extractor,
            signals,
            detector,
            hook: Arc::new(NoopPersistHook),
            tasks: BackgroundTasks::new(),
        })
    }

    pub fn with_persist_hook(mut self, hook: Arc<dyn PersistHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn extractor(&self) -> &ProtectedExtractor {
        &self.extractor
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Work out the outcome for one claimed job. Never fails: store errors become
    /// retryable `storage` failures.
    pub async fn process(&self, job: &ExtractionJob) -> JobOutcome {
        let key = job.key();
        let mut meta = Map::new();

        let raw = match self.stores.raw.get_raw(&key).await {
            Ok(raw) => raw,
            Err(err) => return finish(storage_failure("raw_load_failed", &err), meta),
        };
        if let Some(raw) = &raw {
            meta.insert("content_hash".into(), json!(content_hash(&raw.text)));
        }

        let decision = route(raw.as_ref());
        meta.insert("route".into(), json!(decision.as_str()));
        match (decision, raw) {
            (RouteDecision::Extract, Some(raw)) => self.extract_and_persist(&raw, meta).await,
            (RouteDecision::Extract, None) => {
                finish(JobOutcome::skipped(SkipReason::RawMissing), meta)
            }
            (RouteDecision::Skip(reason), _) => {
                debug!(reason = %reason, "job skipped by router");
                finish(JobOutcome::skipped(reason), meta)
            }
            (RouteDecision::Bump { parent }, _) => {
                meta.insert("bump_parent".into(), json!(parent.to_string()));
                let bumper = self.bumper.clone();
                self.tasks.spawn("reply_bump", async move {
                    bumper.bump(&parent, Utc::now()).await.map(|_| ())
                });
                finish(JobOutcome::skipped(SkipReason::Reply), meta)
            }
        }
    }

    async fn extract_and_persist(&self, raw: &RawMessage, mut meta: Map<String, Value>) -> JobOutcome {
        let signals = self.signals.build(&raw.text);
        meta.insert("signals_ok".into(), json!(signals.ok));

        let extraction = self.extractor.extract(&raw.text).await;
        meta.insert("extraction".into(), extraction.report.to_json());
        let model = match extraction.result {
            Ok(model) => model,
            Err(err) => {
                let failure = JobFailure::new(err.kind(), err.code(), err.to_string());
                return finish(JobOutcome::failed(failure), meta);
            }
        };

        if !model.is_assignment && !signals.has_academic_content() {
            return finish(JobOutcome::skipped(SkipReason::NonAssignment), meta);
        }

        let model_subjects = self.composer.canonical_subjects(&model.subjects);
        let mut draft = self
            .composer
            .compose(raw, &signals, &model, &self.config.pipeline_version);
        let report = self.validator.check(&draft, &signals, &model_subjects);
        meta.insert("validation".into(), report.to_json());
        if let Err(code) = self.validator.apply(&mut draft, &report) {
            warn!(code = code.as_str(), "draft rejected by validation");
            let failure = JobFailure::new(FailureKind::Validation, code.as_str(), code.to_string());
            return finish(JobOutcome::failed(failure), meta);
        }

        let outcome = match self.persister.persist(&draft).await {
            Ok(outcome) => outcome,
            Err(err) => return finish(storage_failure("persist_failed", &err), meta),
        };
        let (result, created) = match &outcome {
            PersistOutcome::Created(_) => ("created", true),
            PersistOutcome::Updated(_) => ("updated", false),
            PersistOutcome::Kept(_) => ("kept", false),
        };
        meta.insert("persist".into(), json!(result));
        if let Some(record) = outcome.record() {
            meta.insert("assignment_id".into(), json!(record.id));
        }

        if let (true, Some(record)) = (outcome.was_written(), outcome.record()) {
            let detector = self.detector.clone();
            let assignment_id = record.id;
            self.tasks.spawn("duplicate_detection", async move {
                detector.detect(assignment_id).await.map(|_| ())
            });

            let hook = self.hook.clone();
            let record = record.clone();
            self.tasks.spawn("persist_hook", async move {
                hook.on_persisted(&record, created).await
            });
        }

        finish(JobOutcome::Ok { meta: Value::Null }, meta)
    }

    /// Process and complete one job. `None` when the completion could not be written.
    async fn handle(&self, job: ExtractionJob) -> Option<CompleteResult> {
        let span = info_span!(
            "job",
            job_id = job.id,
            channel = %job.channel,
            message_id = job.message_id,
            attempt = job.attempt,
            worker_id = %self.config.worker_id,
        );
        async {
            let outcome = self.process(&job).await;
            match self.stores.queue.complete(&job, &outcome).await {
                Ok(CompleteResult::Applied(status)) => {
                    match &outcome {
                        JobOutcome::Failed { failure, .. } => warn!(
                            status = %status,
                            failure_kind = %failure.kind,
                            error_code = %failure.code,
                            error = %failure.message,
                            "job failed"
                        ),
                        _ => info!(status = %status, "job completed"),
                    }
                    Some(CompleteResult::Applied(status))
                }
                Ok(CompleteResult::Stale) => {
                    warn!("job was re-queued or reclaimed while processing; result discarded");
                    Some(CompleteResult::Stale)
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to complete job");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_batch(&self, jobs: Vec<ExtractionJob>) -> RunSummary {
        let mut summary = RunSummary {
            claimed: jobs.len(),
            ..RunSummary::default()
        };
        let results = futures::future::join_all(jobs.into_iter().map(|job| self.handle(job))).await;
        for result in results {
            summary.record(result);
        }
        summary
    }

    /// Claim one batch, process it and wait for its background work.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let jobs = self
            .stores
            .queue
            .claim_batch(&self.config.worker_id, self.config.batch_size)
            .await
            .context("claiming jobs")?;
        let summary = self.handle_batch(jobs).await;
        self.tasks.drain().await;
        Ok(summary)
    }

    /// Poll until `shutdown` fires. Queue errors are logged and backed off, never fatal.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            pipeline_version = %self.config.pipeline_version,
            "worker starting"
        );
        let claim_backoff = BackoffPolicy::new(
            usize::MAX,
            self.config.poll_interval().max(Duration::from_millis(100)),
            MAX_CLAIM_BACKOFF,
        );
        let mut claim_failures = 0usize;
        let mut total = RunSummary::default();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .stores
                .queue
                .claim_batch(&self.config.worker_id, self.config.batch_size)
                .await
            {
                Ok(jobs) => {
                    claim_failures = 0;
                    jobs
                }
                Err(err) => {
                    let delay = claim_backoff.delay_for_attempt(claim_failures);
                    claim_failures = claim_failures.saturating_add(1);
                    error!(
                        error = %format!("{err:#}"),
                        delay_ms = delay.as_millis() as u64,
                        "failed to claim jobs"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");
            let batch = self.handle_batch(jobs).await;
            debug!(?batch, "batch finished");
            total.absorb(batch);
        }

        info!(pending = self.tasks.pending(), "waiting for background tasks");
        self.tasks.drain().await;
        info!(
            worker_id = %self.config.worker_id,
            claimed = total.claimed,
            ok = total.ok,
            failed = total.failed,
            "worker stopped"
        );
        Ok(total)
    }
}
