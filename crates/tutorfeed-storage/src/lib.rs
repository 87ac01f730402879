//! Durable stores for raw messages, the extraction queue, canonical assignments and
//! duplicate groups, with Postgres and in-memory implementations.

mod memory;
mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tutorfeed_core::{
    BackoffPolicy, CanonicalAssignment, CompleteResult, DuplicateGroup, DuplicateMember,
    EnqueueResult, ExtractionJob, JobOutcome, MessageKey, RawMessage, SkipReason, StatusCounts,
};

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreOptions};

pub const CRATE_NAME: &str = "tutorfeed-storage";

/// SHA-256 of message text, recorded with job results so triage can tell whether text changed.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Queue behaviour fixed for the lifetime of a store handle.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Only jobs for this version are ever claimed.
    pub pipeline_version: String,
    pub max_attempts: i32,
    /// A processing job whose claim is older than this is reclaimable.
    pub stale_after: Duration,
    pub retry_backoff: BackoffPolicy,
}

impl QueueSettings {
    pub fn new(pipeline_version: impl Into<String>) -> Self {
        Self {
            pipeline_version: pipeline_version.into(),
            max_attempts: 3,
            stale_after: Duration::minutes(10),
            retry_backoff: BackoffPolicy::new(
                8,
                std::time::Duration::from_secs(30),
                std::time::Duration::from_secs(30 * 60),
            ),
        }
    }

    /// Status a failed claim moves to, given the attempt count it was claimed with.
    pub(crate) fn failure_transition(
        &self,
        claimed_attempt: i32,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> FailureTransition {
        let attempt = claimed_attempt + 1;
        if retryable && attempt < self.max_attempts {
            let delay = self
                .retry_backoff
                .chrono_delay_for_attempt(claimed_attempt.max(0) as usize);
            FailureTransition::Retry {
                attempt,
                next_attempt_at: now + delay,
            }
        } else {
            FailureTransition::Terminal { attempt }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureTransition {
    Retry {
        attempt: i32,
        next_attempt_at: DateTime<Utc>,
    },
    Terminal {
        attempt: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawUpsert {
    Inserted,
    /// Stored text was replaced by a strictly later edit.
    Edited,
    /// Only `last_seen_at` moved.
    Unchanged,
}

#[async_trait]
pub trait RawStore: Send + Sync {
    async fn upsert_raw(&self, raw: &RawMessage) -> Result<RawUpsert>;

    async fn get_raw(&self, key: &MessageKey) -> Result<Option<RawMessage>>;

    /// Raw messages whose `last_seen_at` is at or after `since`, oldest first.
    async fn raw_seen_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<RawMessage>>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the job for `key` under the store's pipeline version. `force` resets an
    /// existing job to pending with a fresh attempt budget and a new generation.
    async fn enqueue(&self, key: &MessageKey, force: bool) -> Result<EnqueueResult>;

    /// Atomically claim up to `limit` pending or stale jobs. Concurrent callers never
    /// receive the same job.
    async fn claim_batch(&self, worker_id: &str, limit: i64) -> Result<Vec<ExtractionJob>>;

    /// Finish a claimed job. Writes nothing and returns `Stale` if the job was re-queued or
    /// reclaimed since `job` was claimed.
    async fn complete(&self, job: &ExtractionJob, outcome: &JobOutcome) -> Result<CompleteResult>;

    /// Return processing jobs claimed before `now - older_than` to pending, counting the
    /// abandoned run as an attempt. Returns the number of jobs touched.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64>;

    async fn get_job(&self, key: &MessageKey) -> Result<Option<ExtractionJob>>;

    /// Terminal failures for the current version, most recent first.
    async fn failed_jobs(&self, limit: i64) -> Result<Vec<ExtractionJob>>;

    async fn skipped_jobs(&self, reason: SkipReason, limit: i64) -> Result<Vec<ExtractionJob>>;

    async fn status_counts(&self) -> Result<StatusCounts>;
}

/// Result of a merge callback run under the per-key write lock.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    Write(CanonicalAssignment),
    Keep,
}

pub type MergeFn<'a> =
    dyn Fn(Option<CanonicalAssignment>) -> MergeDecision + Send + Sync + 'a;

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Created(CanonicalAssignment),
    Updated(CanonicalAssignment),
    /// The merge chose to keep the stored record (or there was none and nothing to write).
    Kept(Option<CanonicalAssignment>),
}

impl PersistOutcome {
    pub fn record(&self) -> Option<&CanonicalAssignment> {
        match self {
            PersistOutcome::Created(r) | PersistOutcome::Updated(r) => Some(r),
            PersistOutcome::Kept(r) => r.as_ref(),
        }
    }

    pub fn was_written(&self) -> bool {
        matches!(self, PersistOutcome::Created(_) | PersistOutcome::Updated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpOutcome {
    Bumped { bump_count: i32 },
    /// Last bump is within the minimum interval.
    Throttled,
    NotFound,
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Read-merge-write for `key` serialized against other writers of the same key.
    /// The callback sees the stored record (if any) and decides what to write.
    async fn merge_upsert(&self, key: &MessageKey, merge: &MergeFn<'_>) -> Result<PersistOutcome>;

    async fn get_assignment(&self, key: &MessageKey) -> Result<Option<CanonicalAssignment>>;

    async fn get_assignment_by_id(&self, id: i64) -> Result<Option<CanonicalAssignment>>;

    /// Advance freshness metadata only, at most once per `min_interval`.
    async fn bump(
        &self,
        key: &MessageKey,
        now: DateTime<Utc>,
        min_interval: Duration,
    ) -> Result<BumpOutcome>;

    /// Open assignments published at or after `since`, newest first.
    async fn open_published_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CanonicalAssignment>>;

    /// Mark open assignments not seen since `last_seen_before` as expired.
    async fn expire_unseen(&self, last_seen_before: DateTime<Utc>) -> Result<u64>;

    async fn assignment_count(&self) -> Result<u64>;
}

/// Desired state of one duplicate group after a detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    /// Group to update in place; a new group is created when `None`.
    pub group_id: Option<i64>,
    /// Groups folded into `group_id` and then removed.
    pub absorbed_group_ids: Vec<i64>,
    pub primary_assignment_id: i64,
    pub members: Vec<DuplicateMember>,
}

#[async_trait]
pub trait DuplicateStore: Send + Sync {
    async fn group_for_assignment(&self, assignment_id: i64) -> Result<Option<DuplicateGroup>>;

    /// Apply a plan atomically, updating member rows and the assignments' group fields.
    async fn save_group(&self, plan: &GroupPlan) -> Result<DuplicateGroup>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            content_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn failure_transition_retries_until_limit() {
        let settings = QueueSettings::new("v1");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();

        match settings.failure_transition(0, true, now) {
            FailureTransition::Retry {
                attempt,
                next_attempt_at,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(next_attempt_at, now + Duration::seconds(30));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(
            settings.failure_transition(2, true, now),
            FailureTransition::Terminal { attempt: 3 }
        );
        assert_eq!(
            settings.failure_transition(0, false, now),
            FailureTransition::Terminal { attempt: 1 }
        );
    }
}
