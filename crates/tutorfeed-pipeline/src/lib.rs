//! Orchestration: routing, composition, validation, merge, duplicate detection and the
//! worker loop that drives them from the extraction queue.

mod bump;
mod compose;
mod config;
mod dedup;
mod ingest;
mod maintenance;
mod merge;
mod persist;
mod router;
mod tasks;
mod triage;
mod validate;
mod worker;

use std::sync::Arc;

use tutorfeed_storage::{AssignmentStore, DuplicateStore, JobQueue, RawStore};

pub use bump::Bumper;
pub use compose::Composer;
pub use config::{parse_channel_quality, PipelineConfig, ValidationMode, DEFAULT_CHANNEL_QUALITY};
pub use dedup::{DedupConfig, DedupOutcome, DuplicateDetector, Similarity};
pub use ingest::{parse_jsonl, IngestSummary, Ingestor};
pub use maintenance::{Maintenance, SweepReport};
pub use merge::merge_draft;
pub use persist::{NoopPersistHook, PersistHook, Persister};
pub use router::{route, RouteDecision};
pub use tasks::BackgroundTasks;
pub use triage::{triage_markdown, triage_report};
pub use validate::{ValidationCode, ValidationReport, Validator};
pub use worker::{RunSummary, Worker};

pub const CRATE_NAME: &str = "tutorfeed-pipeline";

/// Handles to the four stores. One backing store usually implements all of them.
#[derive(Clone)]
pub struct Stores {
    pub raw: Arc<dyn RawStore>,
    pub queue: Arc<dyn JobQueue>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub duplicates: Arc<dyn DuplicateStore>,
}

impl Stores {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: RawStore + JobQueue + AssignmentStore + DuplicateStore + 'static,
    {
        Self {
            raw: store.clone(),
            queue: store.clone(),
            assignments: store.clone(),
            duplicates: store,
        }
    }
}
