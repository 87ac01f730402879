use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageKey, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Ok,
    Failed,
    Skipped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Ok,
        JobStatus::Failed,
        JobStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ok | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("job status", s))
    }
}

/// Why a job finished without producing an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Forward,
    Reply,
    EmptyText,
    RawMissing,
    NonAssignment,
}

impl SkipReason {
    pub const ALL: [SkipReason; 5] = [
        SkipReason::Forward,
        SkipReason::Reply,
        SkipReason::EmptyText,
        SkipReason::RawMissing,
        SkipReason::NonAssignment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Forward => "forward",
            SkipReason::Reply => "reply",
            SkipReason::EmptyText => "empty_text",
            SkipReason::RawMissing => "raw_missing",
            SkipReason::NonAssignment => "non_assignment",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkipReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SkipReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("skip reason", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ParseError,
    HttpError,
    Transport,
    BreakerOpen,
    Validation,
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ParseError => "parse_error",
            FailureKind::HttpError => "http_error",
            FailureKind::Transport => "transport",
            FailureKind::BreakerOpen => "breaker_open",
            FailureKind::Validation => "validation",
            FailureKind::Storage => "storage",
        }
    }

    /// Hard validation failures only clear when the text changes, which forces a new job.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Validation)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// What a worker reports back to the queue for a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Ok {
        meta: serde_json::Value,
    },
    Skipped {
        reason: SkipReason,
        meta: serde_json::Value,
    },
    Failed {
        failure: JobFailure,
        meta: serde_json::Value,
    },
}

impl JobOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        JobOutcome::Skipped {
            reason,
            meta: serde_json::Value::Null,
        }
    }

    pub fn failed(failure: JobFailure) -> Self {
        JobOutcome::Failed {
            failure,
            meta: serde_json::Value::Null,
        }
    }

    pub fn meta(&self) -> &serde_json::Value {
        match self {
            JobOutcome::Ok { meta }
            | JobOutcome::Skipped { meta, .. }
            | JobOutcome::Failed { meta, .. } => meta,
        }
    }

    pub fn with_meta(self, meta: serde_json::Value) -> Self {
        match self {
            JobOutcome::Ok { .. } => JobOutcome::Ok { meta },
            JobOutcome::Skipped { reason, .. } => JobOutcome::Skipped { reason, meta },
            JobOutcome::Failed { failure, .. } => JobOutcome::Failed { failure, meta },
        }
    }
}

/// One unit of extraction work per (channel, message id, pipeline version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: i64,
    pub channel: String,
    pub message_id: i64,
    pub pipeline_version: String,
    pub status: JobStatus,
    pub attempt: i32,
    /// Bumped by every forced re-enqueue; completions from an older generation are discarded.
    pub generation: i32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<SkipReason>,
    pub error_code: Option<String>,
    pub last_error: Option<String>,
    pub result_meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExtractionJob {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.channel.clone(), self.message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(i64),
    /// A finished or in-flight job was reset to pending by a forced enqueue.
    Requeued(i64),
    AlreadyQueued(i64),
    AlreadyProcessed(i64),
}

impl EnqueueResult {
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueResult::Created(id)
            | EnqueueResult::Requeued(id)
            | EnqueueResult::AlreadyQueued(id)
            | EnqueueResult::AlreadyProcessed(id) => *id,
        }
    }

    pub fn is_new_work(&self) -> bool {
        matches!(self, EnqueueResult::Created(_) | EnqueueResult::Requeued(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteResult {
    Applied(JobStatus),
    /// The job was reclaimed or re-queued since this worker claimed it.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub ok: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Ok => self.ok += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Skipped => self.skipped += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.ok + self.failed + self.skipped
    }
}
