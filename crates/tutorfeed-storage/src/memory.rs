//! Process-local store used by tests, dry runs and single-shot backfills.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tutorfeed_core::{
    CanonicalAssignment, CompleteResult, DuplicateGroup, EnqueueResult, ExtractionJob, JobOutcome,
    JobStatus, MessageKey, RawMessage, SkipReason, StatusCounts, AssignmentStatus,
};

use crate::{
    AssignmentStore, BumpOutcome, DuplicateStore, FailureTransition, GroupPlan, JobQueue,
    MergeDecision, MergeFn, PersistOutcome, QueueSettings, RawStore, RawUpsert,
};

#[derive(Debug, Default)]
struct MemoryState {
    raw: BTreeMap<MessageKey, RawMessage>,
    jobs: BTreeMap<i64, ExtractionJob>,
    job_index: HashMap<(MessageKey, String), i64>,
    next_job_id: i64,
    assignments: BTreeMap<i64, CanonicalAssignment>,
    assignment_index: HashMap<MessageKey, i64>,
    next_assignment_id: i64,
    groups: BTreeMap<i64, DuplicateGroup>,
    next_group_id: i64,
}

#[derive(Debug)]
pub struct MemoryStore {
    settings: QueueSettings,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn all_jobs(&self) -> Vec<ExtractionJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn all_assignments(&self) -> Vec<CanonicalAssignment> {
        self.state.lock().await.assignments.values().cloned().collect()
    }

    pub async fn all_groups(&self) -> Vec<DuplicateGroup> {
        self.state.lock().await.groups.values().cloned().collect()
    }

    /// Enqueue a job under an arbitrary pipeline version, as an older deployment would have.
    pub async fn enqueue_for_version(&self, key: &MessageKey, version: &str) -> EnqueueResult {
        let mut state = self.state.lock().await;
        enqueue_locked(&mut state, key, version, false)
    }
}

fn enqueue_locked(
    state: &mut MemoryState,
    key: &MessageKey,
    version: &str,
    force: bool,
) -> EnqueueResult {
    let index_key = (key.clone(), version.to_string());
    let now = Utc::now();
    if let Some(&id) = state.job_index.get(&index_key) {
        let Some(job) = state.jobs.get_mut(&id) else {
            return EnqueueResult::Created(id);
        };
        if force {
            job.status = JobStatus::Pending;
            job.attempt = 0;
            job.generation += 1;
            job.claimed_at = None;
            job.claimed_by = None;
            job.next_attempt_at = None;
            job.skip_reason = None;
            job.error_code = None;
            job.last_error = None;
            job.completed_at = None;
            job.updated_at = now;
            return EnqueueResult::Requeued(id);
        }
        return match job.status {
            JobStatus::Pending | JobStatus::Processing => EnqueueResult::AlreadyQueued(id),
            _ => EnqueueResult::AlreadyProcessed(id),
        };
    }

    state.next_job_id += 1;
    let id = state.next_job_id;
    state.jobs.insert(
        id,
        ExtractionJob {
            id,
            channel: key.channel.clone(),
            message_id: key.message_id,
            pipeline_version: version.to_string(),
            status: JobStatus::Pending,
            attempt: 0,
            generation: 0,
            claimed_at: None,
            claimed_by: None,
            next_attempt_at: None,
            skip_reason: None,
            error_code: None,
            last_error: None,
            result_meta: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            completed_at: None,
        },
    );
    state.job_index.insert(index_key, id);
    EnqueueResult::Created(id)
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn upsert_raw(&self, raw: &RawMessage) -> Result<RawUpsert> {
        let mut state = self.state.lock().await;
        let key = raw.key();
        match state.raw.get_mut(&key) {
            None => {
                state.raw.insert(key, raw.clone());
                Ok(RawUpsert::Inserted)
            }
            Some(existing) => {
                let last_seen_at = existing.last_seen_at.max(raw.last_seen_at);
                if existing.is_superseded_by(raw) {
                    let first_seen_at = existing.first_seen_at;
                    *existing = raw.clone();
                    existing.first_seen_at = first_seen_at;
                    existing.last_seen_at = last_seen_at;
                    Ok(RawUpsert::Edited)
                } else {
                    existing.last_seen_at = last_seen_at;
                    Ok(RawUpsert::Unchanged)
                }
            }
        }
    }

    async fn get_raw(&self, key: &MessageKey) -> Result<Option<RawMessage>> {
        Ok(self.state.lock().await.raw.get(key).cloned())
    }

    async fn raw_seen_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<RawMessage>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .raw
            .values()
            .filter(|r| r.last_seen_at >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.last_seen_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, key: &MessageKey, force: bool) -> Result<EnqueueResult> {
        let mut state = self.state.lock().await;
        Ok(enqueue_locked(
            &mut state,
            key,
            &self.settings.pipeline_version,
            force,
        ))
    }

    async fn claim_batch(&self, worker_id: &str, limit: i64) -> Result<Vec<ExtractionJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let stale_cutoff = now - self.settings.stale_after;

        let mut ready: Vec<(DateTime<Utc>, i64)> = state
            .jobs
            .values()
            .filter(|job| job.pipeline_version == self.settings.pipeline_version)
            .filter(|job| job.attempt < self.settings.max_attempts)
            .filter(|job| match job.status {
                JobStatus::Pending => job.next_attempt_at.map_or(true, |at| at <= now),
                JobStatus::Processing => job.claimed_at.map_or(true, |at| at < stale_cutoff),
                _ => false,
            })
            .map(|job| (job.next_attempt_at.unwrap_or(job.created_at), job.id))
            .collect();
        ready.sort();
        ready.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, id) in ready {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Processing {
                    job.attempt += 1;
                }
                job.status = JobStatus::Processing;
                job.claimed_at = Some(now);
                job.claimed_by = Some(worker_id.to_string());
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job: &ExtractionJob, outcome: &JobOutcome) -> Result<CompleteResult> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(current) = state.jobs.get_mut(&job.id) else {
            bail!("job {} not found", job.id);
        };
        if current.status != JobStatus::Processing
            || current.claimed_by != job.claimed_by
            || current.generation != job.generation
            || current.attempt != job.attempt
        {
            return Ok(CompleteResult::Stale);
        }

        current.updated_at = now;
        current.result_meta = outcome.meta().clone();
        let status = match outcome {
            JobOutcome::Ok { .. } => {
                current.status = JobStatus::Ok;
                current.skip_reason = None;
                current.error_code = None;
                current.last_error = None;
                current.completed_at = Some(now);
                JobStatus::Ok
            }
            JobOutcome::Skipped { reason, .. } => {
                current.status = JobStatus::Skipped;
                current.skip_reason = Some(*reason);
                current.completed_at = Some(now);
                JobStatus::Skipped
            }
            JobOutcome::Failed { failure, .. } => {
                current.error_code = Some(failure.code.clone());
                current.last_error = Some(failure.message.clone());
                match self
                    .settings
                    .failure_transition(job.attempt, failure.retryable(), now)
                {
                    FailureTransition::Retry {
                        attempt,
                        next_attempt_at,
                    } => {
                        current.status = JobStatus::Pending;
                        current.attempt = attempt;
                        current.next_attempt_at = Some(next_attempt_at);
                        current.claimed_at = None;
                        current.claimed_by = None;
                        JobStatus::Pending
                    }
                    FailureTransition::Terminal { attempt } => {
                        current.status = JobStatus::Failed;
                        current.attempt = attempt;
                        current.completed_at = Some(now);
                        JobStatus::Failed
                    }
                }
            }
        };
        Ok(CompleteResult::Applied(status))
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - older_than;
        let mut touched = 0;
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.pipeline_version == self.settings.pipeline_version
                && job.claimed_at.map_or(true, |at| at < cutoff);
            if !stale {
                continue;
            }
            job.attempt += 1;
            job.claimed_at = None;
            job.claimed_by = None;
            job.updated_at = now;
            if job.attempt >= self.settings.max_attempts {
                job.status = JobStatus::Failed;
                job.error_code = Some("stale_exhausted".to_string());
                job.completed_at = Some(now);
            } else {
                job.status = JobStatus::Pending;
                job.next_attempt_at = None;
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn get_job(&self, key: &MessageKey) -> Result<Option<ExtractionJob>> {
        let state = self.state.lock().await;
        let index_key = (key.clone(), self.settings.pipeline_version.clone());
        Ok(state
            .job_index
            .get(&index_key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<ExtractionJob>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.pipeline_version == self.settings.pipeline_version)
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn skipped_jobs(&self, reason: SkipReason, limit: i64) -> Result<Vec<ExtractionJob>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.pipeline_version == self.settings.pipeline_version)
            .filter(|j| j.status == JobStatus::Skipped && j.skip_reason == Some(reason))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for job in state
            .jobs
            .values()
            .filter(|j| j.pipeline_version == self.settings.pipeline_version)
        {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn merge_upsert(&self, key: &MessageKey, merge: &MergeFn<'_>) -> Result<PersistOutcome> {
        let mut state = self.state.lock().await;
        let existing = state
            .assignment_index
            .get(key)
            .and_then(|id| state.assignments.get(id))
            .cloned();
        let now = Utc::now();

        match merge(existing.clone()) {
            MergeDecision::Keep => Ok(PersistOutcome::Kept(existing)),
            MergeDecision::Write(mut record) => match existing {
                Some(prev) => {
                    record.id = prev.id;
                    record.created_at = prev.created_at;
                    record.updated_at = now;
                    state.assignments.insert(record.id, record.clone());
                    Ok(PersistOutcome::Updated(record))
                }
                None => {
                    state.next_assignment_id += 1;
                    record.id = state.next_assignment_id;
                    record.created_at = now;
                    record.updated_at = now;
                    state.assignment_index.insert(key.clone(), record.id);
                    state.assignments.insert(record.id, record.clone());
                    Ok(PersistOutcome::Created(record))
                }
            },
        }
    }

    async fn get_assignment(&self, key: &MessageKey) -> Result<Option<CanonicalAssignment>> {
        let state = self.state.lock().await;
        Ok(state
            .assignment_index
            .get(key)
            .and_then(|id| state.assignments.get(id))
            .cloned())
    }

    async fn get_assignment_by_id(&self, id: i64) -> Result<Option<CanonicalAssignment>> {
        Ok(self.state.lock().await.assignments.get(&id).cloned())
    }

    async fn bump(
        &self,
        key: &MessageKey,
        now: DateTime<Utc>,
        min_interval: Duration,
    ) -> Result<BumpOutcome> {
        let mut state = self.state.lock().await;
        let Some(id) = state.assignment_index.get(key).copied() else {
            return Ok(BumpOutcome::NotFound);
        };
        let Some(record) = state.assignments.get_mut(&id) else {
            return Ok(BumpOutcome::NotFound);
        };
        if let Some(last) = record.last_bumped_at {
            if now - last < min_interval {
                return Ok(BumpOutcome::Throttled);
            }
        }
        record.last_seen_at = record.last_seen_at.max(now);
        record.last_bumped_at = Some(now);
        record.bump_count += 1;
        record.updated_at = Utc::now();
        Ok(BumpOutcome::Bumped {
            bump_count: record.bump_count,
        })
    }

    async fn open_published_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CanonicalAssignment>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .assignments
            .values()
            .filter(|a| a.status == AssignmentStatus::Open && a.published_at >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn expire_unseen(&self, last_seen_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut expired = 0;
        for record in state.assignments.values_mut() {
            if record.status == AssignmentStatus::Open && record.last_seen_at < last_seen_before {
                record.status = AssignmentStatus::Expired;
                record.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn assignment_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.assignments.len() as u64)
    }
}

#[async_trait]
impl DuplicateStore for MemoryStore {
    async fn group_for_assignment(&self, assignment_id: i64) -> Result<Option<DuplicateGroup>> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .values()
            .find(|g| g.contains(assignment_id))
            .cloned())
    }

    async fn save_group(&self, plan: &GroupPlan) -> Result<DuplicateGroup> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let (group_id, created_at) = match plan.group_id {
            Some(id) => {
                let created_at = state.groups.get(&id).map_or(now, |g| g.created_at);
                (id, created_at)
            }
            None => {
                state.next_group_id += 1;
                (state.next_group_id, now)
            }
        };
        for absorbed in &plan.absorbed_group_ids {
            state.groups.remove(absorbed);
        }

        for member in &plan.members {
            if let Some(record) = state.assignments.get_mut(&member.assignment_id) {
                record.duplicate_group_id = Some(group_id);
                record.is_primary = member.is_primary;
                record.duplicate_confidence = member.confidence;
                record.updated_at = now;
            }
        }

        let group = DuplicateGroup {
            id: group_id,
            primary_assignment_id: plan.primary_assignment_id,
            members: plan.members.clone(),
            created_at,
            updated_at: now,
        };
        state.groups.insert(group_id, group.clone());
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorfeed_core::{FailureKind, JobFailure};

    fn store() -> MemoryStore {
        let mut settings = QueueSettings::new("v1");
        settings.stale_after = Duration::milliseconds(20);
        MemoryStore::new(settings)
    }

    fn raw(message_id: i64, text: &str, edited_at: Option<DateTime<Utc>>) -> RawMessage {
        let sent = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        RawMessage {
            channel: "sgtutors".into(),
            message_id,
            text: text.into(),
            sent_at: sent,
            edited_at,
            is_forward: false,
            is_reply: false,
            reply_to_message_id: None,
            first_seen_at: sent,
            last_seen_at: edited_at.unwrap_or(sent),
            meta: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn raw_upsert_only_applies_later_edits() {
        let store = store();
        let t1 = Utc::now();
        let t0 = t1 - Duration::hours(1);
        assert_eq!(store.upsert_raw(&raw(1, "v0", None)).await.unwrap(), RawUpsert::Inserted);
        assert_eq!(store.upsert_raw(&raw(1, "v2", Some(t1))).await.unwrap(), RawUpsert::Edited);
        assert_eq!(store.upsert_raw(&raw(1, "v1", Some(t0))).await.unwrap(), RawUpsert::Unchanged);

        let stored = store.get_raw(&MessageKey::new("sgtutors", 1)).await.unwrap().unwrap();
        assert_eq!(stored.text, "v2");
        assert_eq!(stored.edited_at, Some(t1));
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let store = std::sync::Arc::new(store());
        for id in 0..20 {
            store.enqueue(&MessageKey::new("c", id), false).await.unwrap();
        }
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch("a", 15).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch("b", 15).await.unwrap() })
        };
        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert_eq!(a.len() + b.len(), 20);
        let ids_a: std::collections::HashSet<_> = a.iter().map(|j| j.id).collect();
        assert!(b.iter().all(|j| !ids_a.contains(&j.id)));
    }

    #[tokio::test]
    async fn forced_enqueue_discards_in_flight_completion() {
        let store = store();
        let key = MessageKey::new("c", 1);
        store.enqueue(&key, false).await.unwrap();
        let claimed = store.claim_batch("w1", 1).await.unwrap().remove(0);

        assert!(matches!(store.enqueue(&key, false).await.unwrap(), EnqueueResult::AlreadyQueued(_)));
        assert!(matches!(store.enqueue(&key, true).await.unwrap(), EnqueueResult::Requeued(_)));

        let outcome = JobOutcome::Ok { meta: serde_json::json!({}) };
        assert_eq!(store.complete(&claimed, &outcome).await.unwrap(), CompleteResult::Stale);
        assert_eq!(store.get_job(&key).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_into_terminal_failed() {
        let mut settings = QueueSettings::new("v1");
        settings.max_attempts = 2;
        settings.retry_backoff.base_delay = std::time::Duration::ZERO;
        let store = MemoryStore::new(settings);
        let key = MessageKey::new("c", 1);
        store.enqueue(&key, false).await.unwrap();
        let failure = JobOutcome::failed(JobFailure::new(FailureKind::Timeout, "timeout", "slow"));

        let job = store.claim_batch("w", 1).await.unwrap().remove(0);
        assert_eq!(
            store.complete(&job, &failure).await.unwrap(),
            CompleteResult::Applied(JobStatus::Pending)
        );
        let job = store.claim_batch("w", 1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 1);
        assert_eq!(
            store.complete(&job, &failure).await.unwrap(),
            CompleteResult::Applied(JobStatus::Failed)
        );
        assert!(store.claim_batch("w", 1).await.unwrap().is_empty());
        assert_eq!(store.failed_jobs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn old_version_jobs_are_never_claimed() {
        let store = store();
        store.enqueue_for_version(&MessageKey::new("c", 1), "v0").await;
        assert!(store.claim_batch("w", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_stale_counts_abandoned_run() {
        let store = store();
        let key = MessageKey::new("c", 1);
        store.enqueue(&key, false).await.unwrap();
        store.claim_batch("w1", 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        assert_eq!(store.requeue_stale(Duration::milliseconds(20)).await.unwrap(), 1);
        let job = store.get_job(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 1);
    }
}
