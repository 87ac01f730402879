//! Core domain model for the tutoring-assignment feed.

mod assignment;
mod duplicate;
mod job;
mod message;
mod retry;

pub use assignment::{
    AcademicRequest, AssignmentDraft, AssignmentKind, AssignmentStatus, CanonicalAssignment, Field,
    FieldSource, LearningMode, Level, Location, Provenance, RateRange, TimeWindow, TutorType,
    TutorTypeRate,
};
pub use duplicate::{DuplicateGroup, DuplicateMember};
pub use job::{
    CompleteResult, EnqueueResult, ExtractionJob, FailureKind, JobFailure, JobOutcome, JobStatus,
    SkipReason, StatusCounts,
};
pub use message::{MessageKey, RawMessage};
pub use retry::BackoffPolicy;

pub const CRATE_NAME: &str = "tutorfeed-core";

/// Returned when a persisted enum column holds a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
